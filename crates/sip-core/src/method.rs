// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

/// SIP request methods the transaction layer distinguishes.
///
/// Only INVITE, ACK and CANCEL change transaction behaviour; every other
/// method runs the non-INVITE machines. Extension methods keep their token so
/// that colliding transaction ids can still be told apart by method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Update,
    Message,
    Prack,
    Refer,
    Subscribe,
    Notify,
    Publish,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase string representation for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Message => "MESSAGE",
            Method::Prack => "PRACK",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Publish => "PUBLISH",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, returning Unknown for extension methods.
    ///
    /// Known methods match case-insensitively; extension tokens are kept
    /// verbatim since RFC 3261 method names are case-sensitive.
    pub fn from_token(token: &str) -> Self {
        const KNOWN: [(&str, Method); 14] = [
            ("INVITE", Method::Invite),
            ("ACK", Method::Ack),
            ("BYE", Method::Bye),
            ("CANCEL", Method::Cancel),
            ("REGISTER", Method::Register),
            ("OPTIONS", Method::Options),
            ("INFO", Method::Info),
            ("UPDATE", Method::Update),
            ("MESSAGE", Method::Message),
            ("PRACK", Method::Prack),
            ("REFER", Method::Refer),
            ("SUBSCRIBE", Method::Subscribe),
            ("NOTIFY", Method::Notify),
            ("PUBLISH", Method::Publish),
        ];
        KNOWN
            .iter()
            .find(|(name, _)| token.eq_ignore_ascii_case(name))
            .map(|(_, method)| method.clone())
            .unwrap_or_else(|| Method::Unknown(SmolStr::new(token)))
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Method::Ack)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Method::Cancel)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
