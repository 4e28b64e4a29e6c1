// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use sip_core::{Request, SipMessage};
use smol_str::SmolStr;

use crate::{
    timers::Timer,
    transport::{Target, TransportFailure},
    tu::TuId,
    TransactionId, TransactionKey,
};

/// Everything the engine reacts to, in the order it was enqueued.
#[derive(Debug)]
pub enum Event {
    /// A message received from the network.
    Wire(WireMessage),
    /// A message sent down by a TU.
    Application(AppMessage),
    /// The TU wants the client INVITE `id` cancelled.
    CancelClientInvite { id: TransactionId },
    /// The TU gives up on the server transaction `id` without answering.
    AbandonServer { id: TransactionId },
    TimerFired(Timer),
    /// A pending DNS resolution made progress.
    DnsCompleted { key: TransactionKey },
    TransportFailure {
        key: TransactionKey,
        failure: TransportFailure,
    },
}

/// A message as handed over by the parsing collaborator.
#[derive(Debug)]
pub struct WireMessage {
    pub parsed: Result<SipMessage, ParseError>,
    pub source: Target,
}

impl WireMessage {
    pub fn new(message: impl Into<SipMessage>, source: Target) -> Self {
        Self {
            parsed: Ok(message.into()),
            source,
        }
    }
}

/// A message from a TU.
#[derive(Debug)]
pub struct AppMessage {
    pub message: SipMessage,
    pub owner: TuId,
    /// Send here instead of resolving the Request-URI/Route.
    pub destination: Option<Target>,
}

impl AppMessage {
    pub fn new(message: impl Into<SipMessage>, owner: TuId) -> Self {
        Self {
            message: message.into(),
            owner,
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: Target) -> Self {
        self.destination = Some(destination);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidStartLine,
    MalformedHeader { name: SmolStr },
    MissingHeader { name: SmolStr },
    BodyLengthMismatch,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStartLine => write!(f, "Malformed start line"),
            Self::MalformedHeader { name } => write!(f, "Malformed {} header", name),
            Self::MissingHeader { name } => write!(f, "Missing {} header", name),
            Self::BodyLengthMismatch => write!(f, "Content-Length mismatch"),
        }
    }
}

/// Failure from the parsing collaborator.
///
/// `partial` carries whatever request could be recovered, which is enough
/// to answer it with a 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub partial: Option<Request>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for ParseError {}
