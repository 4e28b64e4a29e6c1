// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Construction of the messages a transaction layer has to forge on its own:
//! responses to requests it answers locally, the CANCEL for a pending INVITE,
//! and the ACK for a non-2xx final response (RFC 3261 §9.1, §17.1.1.3).

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::{
    headers::Headers,
    method::Method,
    msg::{Request, RequestLine, Response, StatusLine},
};

/// Builds a response to `request`.
///
/// Copies Via, From, To, Call-ID and CSeq. A To tag is added for every
/// response above 100 that does not carry one yet, and Record-Route is
/// reflected on 101-299 responses. `reason` defaults to the RFC phrase.
pub fn make_response(request: &Request, code: u16, reason: Option<&str>) -> Response {
    let src = request.headers();
    let mut headers = Headers::new();
    headers.copy_from(src, "Via");
    headers.copy_from(src, "From");
    headers.copy_from(src, "To");
    headers.copy_from(src, "Call-ID");
    headers.copy_from(src, "CSeq");
    if (101..300).contains(&code) {
        headers.copy_from(src, "Record-Route");
    }

    if code > 100 && headers.to_tag().is_none() {
        if let Some(to) = headers.get_mut("To") {
            *to = SmolStr::new(format!("{};tag={}", to, generate_tag()));
        }
    }
    headers.push("Content-Length", "0");

    let reason = reason.unwrap_or_else(|| default_reason(code));
    Response::without_body(StatusLine::sanitized(code, reason), headers)
}

/// Builds the CANCEL for a pending INVITE.
///
/// Shares the INVITE's Request-URI, top Via (and therefore branch), From, To,
/// Call-ID, CSeq number, Route set and credentials.
pub fn make_cancel(invite: &Request) -> Request {
    debug_assert!(invite.method().is_invite());
    let src = invite.headers();
    let mut headers = Headers::new();
    if let Some(via) = src.get("Via") {
        headers.push("Via", via.clone());
    }
    headers.push("Max-Forwards", "70");
    headers.copy_from(src, "From");
    headers.copy_from(src, "To");
    headers.copy_from(src, "Call-ID");
    headers.push("CSeq", cseq_with_method(src, &Method::Cancel));
    headers.copy_from(src, "Route");
    headers.copy_from(src, "Authorization");
    headers.copy_from(src, "Proxy-Authorization");
    headers.push("Content-Length", "0");

    Request::without_body(
        RequestLine::new(Method::Cancel, invite.uri().to_owned()),
        headers,
    )
}

/// Builds the hop-by-hop ACK for a 3xx-6xx response to `invite`.
///
/// The To header comes from the response so that the remote tag is kept.
pub fn make_failure_ack(invite: &Request, response: &Response) -> Request {
    debug_assert!(invite.method().is_invite());
    let src = invite.headers();
    let mut headers = Headers::new();
    if let Some(via) = src.get("Via") {
        headers.push("Via", via.clone());
    }
    headers.push("Max-Forwards", "70");
    headers.copy_from(src, "From");
    match response.headers().get("To") {
        Some(to) => headers.push("To", to.clone()),
        None => headers.copy_from(src, "To"),
    }
    headers.copy_from(src, "Call-ID");
    headers.push("CSeq", cseq_with_method(src, &Method::Ack));
    headers.copy_from(src, "Route");
    headers.push("Content-Length", "0");

    Request::without_body(RequestLine::new(Method::Ack, invite.uri().to_owned()), headers)
}

/// Formats a `Warning` header value (RFC 3261 §20.43).
pub fn warning_value(code: u16, agent: &str, text: &str) -> SmolStr {
    let text = text.replace('"', "'");
    SmolStr::new(format!("{} {} \"{}\"", code, agent, text))
}

/// Generates a random From/To tag.
pub fn generate_tag() -> SmolStr {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}

/// Reason phrases for the codes a transaction layer synthesizes.
pub fn default_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        410 => "Gone",
        430 => "Flow Failed",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => match code / 100 {
            1 => "Provisional",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            5 => "Server Error",
            _ => "Global Failure",
        },
    }
}

fn cseq_with_method(headers: &Headers, method: &Method) -> SmolStr {
    let number = headers.cseq().map(|cseq| cseq.number).unwrap_or(1);
    SmolStr::new(format!("{} {}", number, method.as_str()))
}
