// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! The [`Engine`] owns a [`TimerRegistry`] and two [`TransactionTable`]s (one
//! per [`Side`]) and runs six state machines over them: client/server INVITE,
//! client/server non-INVITE, and the lingering stale-client/stale-server
//! variants, plus a stateless pass-through for ACKs to 2xx and stray
//! responses.
//!
//! Everything the engine needs from the outside world goes through two
//! collaborator traits:
//! - [`TransportCoordinator`]: transmit a message to a [`Target`], start DNS
//!   resolution and hand back a [`DnsResolution`].
//! - [`TuDispatcher`]: pick an owner for new inbound requests, deliver
//!   messages and termination notices, report congestion.
//!
//! Both are called synchronously from the engine and must not block; anything
//! slow completes later by pushing an [`Event`] through an [`EngineHandle`].
//! The [`Driver`] is the single consumer that drains those events and fires
//! due timers, so no record is ever touched from two threads.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sip_transaction::{Driver, Engine, TransactionConfig, TransportCoordinator, TuDispatcher};
//!
//! # async fn run(transport: Arc<dyn TransportCoordinator>, tu: Arc<dyn TuDispatcher>) {
//! let engine = Engine::new(TransactionConfig::default(), transport, tu);
//! let (driver, handle) = Driver::new(engine);
//! tokio::spawn(driver.run());
//! // transports and TUs now feed `handle.submit(...)`
//! # drop(handle);
//! # }
//! ```

mod client;
pub mod config;
pub mod driver;
pub mod engine;
pub mod event;
pub mod metrics;
pub mod record;
mod server;
pub mod table;
pub mod timers;
pub mod transport;
pub mod tu;

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

use sip_core::{Method, SipMessage};
use smol_str::SmolStr;

pub use config::{TimerConfig, TransactionConfig};
pub use driver::{Driver, EngineHandle};
pub use engine::Engine;
pub use event::{AppMessage, Event, ParseError, ParseErrorKind, WireMessage};
pub use metrics::{MetricsSnapshot, TransactionMetrics, TransactionOutcome};
pub use record::{Machine, State, TransactionRecord};
pub use table::TransactionTable;
pub use timers::{Clock, SystemClock, Timer, TimerHandle, TimerKind, TimerRegistry, TokioClock};
pub use transport::{
    Availability, DnsResolution, FailureReason, Target, TransmitState, Transport,
    TransportCoordinator, TransportFailure,
};
pub use tu::{RejectionBehavior, TuDispatcher, TuId};

/// RFC 3261 branch prefix identifying a globally unique branch.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

const CANCEL_SUFFIX: &str = "cancel";

/// Which transaction table an id lives in.
///
/// Client and server ids are separate namespaces: the same string may name a
/// client and a server transaction at once (a proxy forwarding a request
/// with the branch it received does exactly that).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(SmolStr);

impl TransactionId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the CANCEL transaction correlated with this INVITE id.
    pub fn cancel_id(&self) -> Self {
        Self(SmolStr::new(format!("{}{}", self.0, CANCEL_SUFFIX)))
    }

    /// Computes the transaction id of a message as it appears on the wire.
    ///
    /// RFC 3261 branches are used as-is (lowercased). For RFC 2543 peers the
    /// id is a stable hash of Call-ID, From tag, CSeq and the top Via, with
    /// ACK and CANCEL folded onto INVITE so both find their INVITE, as they
    /// do through the shared branch in RFC 3261. CANCEL is not suffixed here;
    /// the engine does that when it picks the table.
    pub fn for_message(message: &SipMessage) -> Option<Self> {
        let headers = message.headers();
        let via = headers.top_via()?;
        if let Some(branch) = via.branch() {
            if has_magic_cookie(branch) && branch.len() > MAGIC_COOKIE.len() {
                return Some(Self(SmolStr::new(branch.to_ascii_lowercase())));
            }
        }

        let cseq = headers.cseq()?;
        let call_id = headers.call_id()?;
        let method = match cseq.method {
            Method::Ack | Method::Cancel => Method::Invite,
            other => other,
        };
        let mut hasher = DefaultHasher::new();
        call_id.hash(&mut hasher);
        headers.from_tag().unwrap_or("").hash(&mut hasher);
        cseq.number.hash(&mut hasher);
        method.as_str().hash(&mut hasher);
        via.sent_by.to_ascii_lowercase().hash(&mut hasher);
        via.branch().unwrap_or("").hash(&mut hasher);
        Some(Self(SmolStr::new(format!("2543-{:016x}", hasher.finish()))))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a record: the table it lives in plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub side: Side,
    pub id: TransactionId,
}

impl TransactionKey {
    pub fn client(id: TransactionId) -> Self {
        Self {
            side: Side::Client,
            id,
        }
    }

    pub fn server(id: TransactionId) -> Self {
        Self {
            side: Side::Server,
            id,
        }
    }

    pub fn is_client(&self) -> bool {
        self.side == Side::Client
    }
}

fn has_magic_cookie(branch: &str) -> bool {
    branch
        .get(..MAGIC_COOKIE.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(MAGIC_COOKIE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, Request, RequestLine};

    fn request(method: Method, via: &str, cseq: &str) -> SipMessage {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("From", "<sip:alice@example.com>;tag=a1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-1@example.com");
        headers.push("CSeq", cseq);
        Request::new(
            RequestLine::new(method, "sip:bob@example.com"),
            headers,
            Bytes::new(),
        )
        .expect("request")
        .into()
    }

    #[test]
    fn rfc3261_branch_is_the_id() {
        let msg = request(
            Method::Invite,
            "SIP/2.0/UDP host.example.com;branch=z9hG4bKAbC123",
            "1 INVITE",
        );
        let id = TransactionId::for_message(&msg).expect("id");
        assert_eq!(id.as_str(), "z9hg4bkabc123");
    }

    #[test]
    fn rfc2543_ack_matches_its_invite() {
        let invite = request(Method::Invite, "SIP/2.0/UDP host.example.com", "5 INVITE");
        let ack = request(Method::Ack, "SIP/2.0/UDP host.example.com", "5 ACK");
        let bye = request(Method::Bye, "SIP/2.0/UDP host.example.com", "5 BYE");
        let invite_id = TransactionId::for_message(&invite).expect("id");
        assert_eq!(Some(invite_id.clone()), TransactionId::for_message(&ack));
        assert_ne!(Some(invite_id), TransactionId::for_message(&bye));
    }

    #[test]
    fn rfc2543_cancel_matches_its_invite() {
        let invite = request(Method::Invite, "SIP/2.0/UDP host.example.com", "7 INVITE");
        let cancel = request(Method::Cancel, "SIP/2.0/UDP host.example.com", "7 CANCEL");
        assert_eq!(
            TransactionId::for_message(&invite),
            TransactionId::for_message(&cancel)
        );
    }

    #[test]
    fn bare_cookie_is_not_an_rfc3261_branch() {
        let msg = request(Method::Options, "SIP/2.0/UDP h;branch=z9hG4bK", "1 OPTIONS");
        let id = TransactionId::for_message(&msg).expect("id");
        assert!(id.as_str().starts_with("2543-"));
    }

    #[test]
    fn cancel_id_is_suffixed() {
        let id = TransactionId::new("z9hg4bk1");
        assert_eq!(id.cancel_id().as_str(), "z9hg4bk1cancel");
    }

    #[test]
    fn missing_via_has_no_id() {
        let mut headers = Headers::new();
        headers.push("CSeq", "1 OPTIONS");
        let msg: SipMessage = Request::new(
            RequestLine::new(Method::Options, "sip:x"),
            headers,
            Bytes::new(),
        )
        .expect("request")
        .into();
        assert!(TransactionId::for_message(&msg).is_none());
    }
}
