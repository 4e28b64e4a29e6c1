// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method};

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// First line of a SIP request.
///
/// The Request-URI is kept as an opaque string; the transaction layer only
/// copies it into derived requests (CANCEL, ACK) and hashes it for RFC 2543
/// transaction ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SmolStr,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<SmolStr>) -> Self {
        Self {
            method,
            uri: uri.into(),
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// First line of a SIP response.
///
/// # Examples
///
/// ```
/// use sip_core::StatusLine;
///
/// let status = StatusLine::new(486, "Busy Here").unwrap();
/// assert!(status.is_final());
/// assert!(StatusLine::new(99, "Invalid").is_err());
/// assert!(StatusLine::new(200, "OK\r\nInjected").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is outside 100-699, or the reason phrase
    /// contains control characters or exceeds 256 bytes.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }

        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;

        Ok(Self {
            code,
            reason: SmolStr::new(reason),
        })
    }

    /// Builds a status line for a code the caller knows is valid, scrubbing
    /// the reason phrase instead of rejecting it.
    pub(crate) fn sanitized(code: u16, reason: &str) -> Self {
        debug_assert!((100..=699).contains(&code), "status code {code} out of range");
        let mut clean: String = reason.chars().filter(|c| !c.is_ascii_control()).collect();
        if clean.len() > MAX_REASON_LENGTH {
            let mut end = MAX_REASON_LENGTH;
            while !clean.is_char_boundary(end) {
                end -= 1;
            }
            clean.truncate(end);
        }
        Self {
            code,
            reason: SmolStr::new(clean),
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns true if this is an informational response (1xx).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true for any response that ends a transaction (>= 200).
    pub fn is_final(&self) -> bool {
        self.code >= 200
    }

    /// Returns true for 3xx-6xx.
    pub fn is_failure(&self) -> bool {
        self.code >= 300
    }
}

/// In-memory representation of a SIP request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Builds a request from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds 10MB.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub(crate) fn without_body(start: RequestLine, headers: Headers) -> Self {
        Self {
            start,
            headers,
            body: Bytes::new(),
        }
    }

    /// Returns the request line.
    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        self.start.method()
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &str {
        self.start.uri()
    }

    /// Returns the headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (RequestLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// In-memory representation of a SIP response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Builds a response from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds 10MB.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub(crate) fn without_body(start: StatusLine, headers: Headers) -> Self {
        Self {
            start,
            headers,
            body: Bytes::new(),
        }
    }

    /// Returns the status line.
    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code()
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    /// Replaces the status line, keeping headers and body.
    pub fn set_status(&mut self, code: u16, reason: &str) {
        self.start = StatusLine::sanitized(code, reason);
    }

    /// Returns the headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_provisional(&self) -> bool {
        self.start.is_provisional()
    }

    pub fn is_success(&self) -> bool {
        self.start.is_success()
    }

    pub fn is_final(&self) -> bool {
        self.start.is_final()
    }

    pub fn is_failure(&self) -> bool {
        self.start.is_failure()
    }

    /// Method of the request this response answers, taken from CSeq.
    pub fn cseq_method(&self) -> Option<Method> {
        self.headers.cseq().map(|cseq| cseq.method)
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    /// Returns true if this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Returns true if this is a response.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Returns a reference to the request if this is a request.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Returns a reference to the response if this is a response.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    /// Returns the headers regardless of message type.
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => req.headers(),
            Self::Response(res) => res.headers(),
        }
    }

    /// Returns mutable headers regardless of message type.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Request(req) => req.headers_mut(),
            Self::Response(res) => res.headers_mut(),
        }
    }

    /// Method of the request line, or of CSeq for responses.
    pub fn method(&self) -> Option<Method> {
        match self {
            Self::Request(req) => Some(req.method().clone()),
            Self::Response(res) => res.cseq_method(),
        }
    }

    /// Short single-line description for logs.
    pub fn brief(&self) -> String {
        match self {
            Self::Request(req) => format!("{} {}", req.method(), req.uri()),
            Self::Response(res) => format!(
                "{} {} / {}",
                res.code(),
                res.reason(),
                res.cseq_method()
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_else(|| "?".to_owned())
            ),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        Self::Response(res)
    }
}

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }

    // Reason-Phrase is UTF8-TEXT, which excludes control characters
    if reason.chars().any(|c| c.is_ascii_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_classes() {
        let trying = StatusLine::new(100, "Trying").unwrap();
        assert!(trying.is_provisional());
        assert!(!trying.is_final());

        let ok = StatusLine::new(200, "OK").unwrap();
        assert!(ok.is_success() && ok.is_final() && !ok.is_failure());

        let busy = StatusLine::new(486, "Busy Here").unwrap();
        assert!(busy.is_failure());
    }

    #[test]
    fn reject_invalid_status_codes() {
        assert!(matches!(
            StatusLine::new(700, "Nope"),
            Err(MessageError::InvalidStatusCode { code: 700 })
        ));
    }

    #[test]
    fn reject_oversized_reason() {
        let long = "x".repeat(MAX_REASON_LENGTH + 1);
        assert!(matches!(
            StatusLine::new(200, &long),
            Err(MessageError::ReasonTooLong { .. })
        ));
    }

    #[test]
    fn sanitized_scrubs_control_characters() {
        let line = StatusLine::sanitized(503, "Service\r\nUnavailable");
        assert_eq!(line.reason(), "ServiceUnavailable");
    }

    #[test]
    fn reject_oversized_request_body() {
        let body = Bytes::from(vec![0u8; MAX_BODY_SIZE + 1]);
        let result = Request::new(
            RequestLine::new(Method::Message, "sip:bob@example.com"),
            Headers::new(),
            body,
        );
        assert!(matches!(result, Err(MessageError::BodyTooLarge { .. })));
    }

    #[test]
    fn response_method_comes_from_cseq() {
        let mut headers = Headers::new();
        headers.push("CSeq", "7 INVITE");
        let res = Response::new(StatusLine::new(180, "Ringing").unwrap(), headers, Bytes::new())
            .unwrap();
        let msg = SipMessage::from(res);
        assert_eq!(msg.method(), Some(Method::Invite));
        assert_eq!(msg.brief(), "180 Ringing / INVITE");
    }
}
