// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-transaction state.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    time::Instant,
};

use sip_core::{Method, SipMessage};

use crate::{
    transport::{DnsResolution, FailureReason, Target, TransportFailure},
    tu::TuId,
    Side, TransactionKey,
};

/// The state machine governing a record.
///
/// Fixed at creation, except that a client or server INVITE turns stale once
/// its 2xx has passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    ClientNonInvite,
    ClientInvite,
    ServerNonInvite,
    ServerInvite,
    ClientStale,
    ServerStale,
    Stateless,
}

impl Machine {
    /// The table a record of this machine lives in.
    pub fn side(self) -> Side {
        match self {
            Machine::ClientNonInvite
            | Machine::ClientInvite
            | Machine::ClientStale
            | Machine::Stateless => Side::Client,
            Machine::ServerNonInvite | Machine::ServerInvite | Machine::ServerStale => {
                Side::Server
            }
        }
    }
}

/// States across all machines (RFC 3261 Figures 5-8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// The last message put on the wire, kept for verbatim retransmission
/// together with where it went.
#[derive(Debug, Clone)]
pub struct Retransmission {
    pub message: SipMessage,
    pub target: Target,
}

/// Exclusive handle on a DNS resolution. Releases it when dropped.
pub struct ResolutionHandle(Box<dyn DnsResolution>);

impl ResolutionHandle {
    pub fn new(resolution: Box<dyn DnsResolution>) -> Self {
        Self(resolution)
    }
}

impl Deref for ResolutionHandle {
    type Target = dyn DnsResolution;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for ResolutionHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for ResolutionHandle {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl fmt::Debug for ResolutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResolutionHandle")
    }
}

/// State of one transaction.
#[derive(Debug)]
pub struct TransactionRecord {
    serial: u64,
    key: TransactionKey,
    machine: Machine,
    pub(crate) state: State,
    pub(crate) method: Method,
    pub(crate) owner: TuId,
    pub(crate) is_reliable: bool,
    /// Current request (client) or latest response (server).
    pub(crate) next_transmission: Option<SipMessage>,
    pub(crate) retransmit: Option<Retransmission>,
    pub(crate) target: Option<Target>,
    pub(crate) response_target: Option<Target>,
    pub(crate) is_abandoned: bool,
    pub(crate) ack_is_valid: bool,
    pub(crate) pending_dns: bool,
    /// A client INVITE fell back from Proceeding to Calling; Timer A is
    /// re-armed once the next target is known.
    pub(crate) restart_timer_a: bool,
    pub(crate) failure: TransportFailure,
    pub(crate) resolution: Option<ResolutionHandle>,
    pub(crate) created: Instant,
}

impl TransactionRecord {
    pub(crate) fn new(
        serial: u64,
        key: TransactionKey,
        machine: Machine,
        state: State,
        method: Method,
        owner: TuId,
        created: Instant,
    ) -> Self {
        debug_assert_eq!(machine.side(), key.side, "{machine:?} in the wrong table");
        Self {
            serial,
            key,
            machine,
            state,
            method,
            owner,
            // Unknown until a target is chosen; retransmission timers are
            // armed only once it is.
            is_reliable: true,
            next_transmission: None,
            retransmit: None,
            target: None,
            response_target: None,
            is_abandoned: false,
            ack_is_valid: false,
            pending_dns: false,
            restart_timer_a: false,
            failure: TransportFailure::new(FailureReason::None),
            resolution: None,
            created,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn owner(&self) -> TuId {
        self.owner
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn is_abandoned(&self) -> bool {
        self.is_abandoned
    }

    pub fn pending_dns(&self) -> bool {
        self.pending_dns
    }

    pub fn target(&self) -> Option<Target> {
        self.target
    }

    pub fn has_retransmission(&self) -> bool {
        self.retransmit.is_some()
    }

    pub fn failure(&self) -> TransportFailure {
        self.failure
    }

    /// Turns a client or server INVITE into its stale variant.
    pub(crate) fn become_stale(&mut self) {
        self.machine = match self.machine {
            Machine::ClientInvite => Machine::ClientStale,
            Machine::ServerInvite => Machine::ServerStale,
            other => panic!("{other:?} record cannot become stale"),
        };
    }

    /// Keeps the most severe failure seen so far.
    pub(crate) fn note_failure(&mut self, failure: TransportFailure) {
        if failure.reason > self.failure.reason {
            self.failure = failure;
        }
    }

    /// Points the record at a new target and adopts its reliability.
    ///
    /// Returns true when this moves the record onto an unreliable transport,
    /// which is the moment retransmission timers have to be armed.
    pub(crate) fn set_target(&mut self, target: Target) -> bool {
        self.target = Some(target);
        let became_unreliable = self.is_reliable && !target.is_reliable();
        self.is_reliable = target.is_reliable();
        became_unreliable
    }

    /// Drops the DNS resolution, releasing it.
    pub(crate) fn release_dns(&mut self) {
        self.resolution = None;
        self.pending_dns = false;
    }

    /// The request this client transaction sends, if still held.
    pub(crate) fn request(&self) -> Option<&sip_core::Request> {
        self.next_transmission.as_ref().and_then(SipMessage::as_request)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{transport::Availability, TransactionId};

    struct CountingResolution(Arc<AtomicUsize>);

    impl DnsResolution for CountingResolution {
        fn availability(&mut self) -> Availability {
            Availability::Finished
        }
        fn next(&mut self) -> Option<Target> {
            None
        }
        fn greylist_last(&mut self, _until: Instant) {}
        fn blacklist_last(&mut self, _until: Instant) {}
        fn whitelist_last(&mut self) {}
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(machine: Machine) -> TransactionRecord {
        let key = TransactionKey {
            side: machine.side(),
            id: TransactionId::new("z9hg4bk1"),
        };
        TransactionRecord::new(
            1,
            key,
            machine,
            State::Calling,
            Method::Invite,
            TuId(1),
            Instant::now(),
        )
    }

    #[test]
    fn invite_records_become_stale() {
        let mut client = record(Machine::ClientInvite);
        client.become_stale();
        assert_eq!(client.machine(), Machine::ClientStale);

        let mut server = record(Machine::ServerInvite);
        server.become_stale();
        assert_eq!(server.machine(), Machine::ServerStale);
    }

    #[test]
    #[should_panic]
    fn non_invite_cannot_become_stale() {
        record(Machine::ClientNonInvite).become_stale();
    }

    #[test]
    fn keeps_worst_failure() {
        let mut rec = record(Machine::ClientInvite);
        rec.note_failure(TransportFailure::new(FailureReason::NoRoute));
        rec.note_failure(TransportFailure::new(FailureReason::Failure));
        assert_eq!(rec.failure().reason, FailureReason::NoRoute);
    }

    #[test]
    fn set_target_reports_switch_to_unreliable() {
        use crate::transport::Transport;

        let addr = "192.0.2.1:5060".parse().expect("addr");
        let mut rec = record(Machine::ClientNonInvite);
        assert!(rec.is_reliable());
        assert!(!rec.set_target(Target::new(addr, Transport::Tcp)));
        assert!(rec.set_target(Target::new(addr, Transport::Udp)));
        assert!(!rec.is_reliable());
        // Already unreliable: no second timer.
        assert!(!rec.set_target(Target::new(addr, Transport::Udp)));
        assert!(!rec.set_target(Target::new(addr, Transport::Tls)));
        assert!(rec.is_reliable());
    }

    #[test]
    fn resolution_released_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut rec = record(Machine::ClientInvite);
        rec.resolution = Some(ResolutionHandle::new(Box::new(CountingResolution(
            released.clone(),
        ))));
        rec.pending_dns = true;
        rec.release_dns();
        assert!(!rec.pending_dns());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        drop(rec);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolution_released_with_record() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut rec = record(Machine::ClientNonInvite);
        rec.resolution = Some(ResolutionHandle::new(Box::new(CountingResolution(
            released.clone(),
        ))));
        drop(rec);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
