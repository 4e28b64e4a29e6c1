// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interface to the transport selection and DNS subsystem.
//!
//! The engine never opens sockets or resolves names itself. It asks a
//! [`TransportCoordinator`] to send, or to start resolving a request's
//! destination, and learns about asynchronous outcomes (send failures,
//! resolution progress) through [`Event`](crate::Event)s.

use std::{fmt, net::SocketAddr, time::Instant};

use sip_core::{Request, SipMessage};

use crate::TransactionKey;

/// Transport protocol of a resolved target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Transport {
    /// Returns true for transports that guarantee delivery.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Transport::Udp)
    }

    /// Maps a Via transport token.
    pub fn from_token(token: &str) -> Option<Self> {
        let transport = match token.to_ascii_uppercase().as_str() {
            "UDP" => Transport::Udp,
            "TCP" => Transport::Tcp,
            "TLS" => Transport::Tls,
            "SCTP" => Transport::Sctp,
            "WS" => Transport::Ws,
            "WSS" => Transport::Wss,
            _ => return None,
        };
        Some(transport)
    }

    /// Port assumed when a Via carries none.
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Tls | Transport::Wss => 5061,
            _ => 5060,
        }
    }
}

/// A resolved network destination, or the source of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl Target {
    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self { addr, transport }
    }

    pub fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.transport, self.addr)
    }
}

/// Immediate outcome of handing a message to the transport.
///
/// `Sent` means queued for the wire; a later failure still arrives as
/// [`Event::TransportFailure`](crate::Event::TransportFailure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    Sent,
    Unsent,
}

/// Progress of a DNS resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// `next()` will return a target now.
    Available,
    /// More results may come; a `DnsCompleted` event will follow.
    Pending,
    /// No targets remain.
    Finished,
}

/// Why a send failed. Ordered by severity; a record keeps the worst one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureReason {
    None,
    Failure,
    NoSocket,
    BadConnect,
    ConnectionUnknown,
    ConnectionException,
    /// The flow the request was bound to no longer exists (RFC 5626).
    FlowGone,
    Shutdown,
    CertNameMismatch,
    CertValidationFailure,
    NoTransport,
    NoRoute,
}

impl FailureReason {
    /// Reason phrase of the 503 synthesized when every target failed.
    pub fn exhausted_reason(self) -> &'static str {
        match self {
            FailureReason::None => "No DNS results",
            FailureReason::Failure
            | FailureReason::NoSocket
            | FailureReason::BadConnect
            | FailureReason::ConnectionUnknown
            | FailureReason::ConnectionException => "Transport failure: no transports left to try",
            FailureReason::NoTransport => "No matching transport found",
            FailureReason::NoRoute => "No route to host",
            FailureReason::CertNameMismatch => "Certificate Name Mismatch",
            FailureReason::CertValidationFailure => "Certificate Validation Failure",
            FailureReason::FlowGone => "Flow failed",
            FailureReason::Shutdown => "Transport shutdown: no transports left to try",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A send failure reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportFailure {
    pub reason: FailureReason,
    /// Transport specific detail such as an errno.
    pub sub_code: i32,
}

impl TransportFailure {
    pub fn new(reason: FailureReason) -> Self {
        Self {
            reason,
            sub_code: 0,
        }
    }
}

/// An in-progress or completed DNS resolution for one transaction.
///
/// Owned by exactly one record; the engine calls [`release`](Self::release)
/// once when the record no longer needs it.
pub trait DnsResolution: Send {
    fn availability(&mut self) -> Availability;

    /// Takes the next candidate. Only meaningful after `Available`.
    fn next(&mut self) -> Option<Target>;

    /// Avoid the last returned target until `until`, unless nothing else is left.
    fn greylist_last(&mut self, until: Instant);

    /// Never use the last returned target before `until`.
    fn blacklist_last(&mut self, until: Instant);

    /// The last returned target answered.
    fn whitelist_last(&mut self);

    /// Stops the resolution and frees its resources.
    fn release(&mut self);
}

/// Transport selection and DNS, as seen from the engine.
pub trait TransportCoordinator: Send + Sync {
    /// Sends `message` to `target`.
    fn transmit(&self, key: &TransactionKey, message: &SipMessage, target: &Target)
        -> TransmitState;

    /// Resends a buffered message verbatim.
    fn retransmit(&self, key: &TransactionKey, message: &SipMessage, target: &Target) {
        let _ = self.transmit(key, message, target);
    }

    /// Starts resolving where `request` should go.
    fn resolve(&self, key: &TransactionKey, request: &Request) -> Box<dyn DnsResolution>;
}
