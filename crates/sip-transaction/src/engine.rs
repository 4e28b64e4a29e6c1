// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction engine.
//!
//! [`Engine::handle`] routes every [`Event`] to the record it belongs to,
//! creating records for new work. A record being processed is taken out of
//! its table for the duration of the step and put back afterwards, unless
//! its machine reached `Terminated`, in which case it is dropped (which
//! releases its DNS resolution). Timers armed by a record carry its serial;
//! timers whose record is gone or was replaced are discarded on arrival.
//!
//! The per-machine steps live in `client.rs` and `server.rs`; this module
//! holds what they share: wire and TU delivery, target selection and
//! failover, and the stale and stateless machines.

use std::{sync::Arc, time::Duration};

use sip_core::{
    helpers::{make_response, warning_value},
    Method, Request, Response, SipMessage,
};
use smol_str::SmolStr;
use tracing::{debug, info, trace, warn};

use crate::{
    config::TransactionConfig,
    event::{AppMessage, Event, WireMessage},
    metrics::{TransactionMetrics, TransactionOutcome},
    record::{Machine, ResolutionHandle, Retransmission, State, TransactionRecord},
    table::TransactionTable,
    timers::{Clock, SystemClock, Timer, TimerKind, TimerRegistry},
    transport::{
        Availability, FailureReason, Target, TransmitState, Transport, TransportCoordinator,
        TransportFailure,
    },
    tu::{RejectionBehavior, TuDispatcher, TuId},
    Side, TransactionId, TransactionKey,
};

/// What a machine step reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    /// A message received from the network.
    Wire(SipMessage),
    /// A message sent down by the owner.
    Tu(SipMessage),
    Timer(Timer),
    /// The owner gives up on a server transaction.
    Abandon,
}

/// Where a message handed to the TU came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Wire,
    Internal,
}

/// RFC 3261 §17 transaction engine.
///
/// Single consumer: all mutation happens inside [`handle`](Self::handle) and
/// [`process_due_timers`](Self::process_due_timers), normally called by a
/// [`Driver`](crate::Driver).
pub struct Engine {
    config: TransactionConfig,
    clock: Arc<dyn Clock>,
    timers: TimerRegistry,
    client: TransactionTable,
    server: TransactionTable,
    transport: Arc<dyn TransportCoordinator>,
    tu: Arc<dyn TuDispatcher>,
    rejection: RejectionBehavior,
    next_serial: u64,
    stateless_counter: u64,
    metrics: TransactionMetrics,
}

impl Engine {
    pub fn new(
        config: TransactionConfig,
        transport: Arc<dyn TransportCoordinator>,
        tu: Arc<dyn TuDispatcher>,
    ) -> Self {
        Self::with_clock(config, transport, tu, Arc::new(SystemClock))
    }

    /// Creates an engine reading time from `clock`.
    pub fn with_clock(
        config: TransactionConfig,
        transport: Arc<dyn TransportCoordinator>,
        tu: Arc<dyn TuDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            clock,
            timers: TimerRegistry::new(),
            client: TransactionTable::new(Side::Client),
            server: TransactionTable::new(Side::Server),
            transport,
            tu,
            rejection: RejectionBehavior::Normal,
            next_serial: 0,
            stateless_counter: 0,
            metrics: TransactionMetrics::new(),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &TransactionMetrics {
        &self.metrics
    }

    pub fn client_record(&self, id: &TransactionId) -> Option<&TransactionRecord> {
        self.client.find(id)
    }

    pub fn server_record(&self, id: &TransactionId) -> Option<&TransactionRecord> {
        self.server.find(id)
    }

    pub fn client_transactions(&self) -> &TransactionTable {
        &self.client
    }

    pub fn server_transactions(&self) -> &TransactionTable {
        &self.server
    }

    /// Number of scheduled timers, including ones whose record is gone.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Congestion of the engine's own queue. `RejectingNonEssential` stops
    /// retransmissions while keeping their timers running.
    pub fn set_rejection_behavior(&mut self, behavior: RejectionBehavior) {
        if behavior != self.rejection {
            info!(?behavior, "engine rejection behavior changed");
        }
        self.rejection = behavior;
    }

    pub fn rejection_behavior(&self) -> RejectionBehavior {
        self.rejection
    }

    /// How long the driver may sleep before a timer is due.
    pub fn time_until_next_timer(&self) -> Option<Duration> {
        self.timers.time_until_next(self.clock.now())
    }

    /// Fires every due timer. Returns how many were popped.
    pub fn process_due_timers(&mut self) -> usize {
        let due = self.timers.pop_all_due(self.clock.now());
        let count = due.len();
        for timer in due {
            self.on_timer(timer);
        }
        count
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Wire(wire) => self.on_wire(wire),
            Event::Application(app) => self.on_application(app),
            Event::CancelClientInvite { id } => self.cancel_client_invite(id, None, None),
            Event::AbandonServer { id } => {
                let key = TransactionKey::server(id);
                if self.server.find(&key.id).is_some() {
                    self.run(&key, Input::Abandon);
                } else {
                    debug!(id = %key.id, "abandon for unknown server transaction");
                }
            }
            Event::TimerFired(timer) => self.on_timer(timer),
            Event::DnsCompleted { key } => self.on_dns_completed(&key),
            Event::TransportFailure { key, failure } => self.on_transport_failure(&key, failure),
        }
    }

    // ----- routing -----

    fn on_wire(&mut self, wire: WireMessage) {
        let WireMessage { parsed, source } = wire;
        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                match &err.partial {
                    Some(request) if !request.method().is_ack() => {
                        info!(error = %err, %source, "rejecting malformed request");
                        let reason = err.kind.to_string();
                        self.reply_statelessly(request, source, 400, Some(&reason));
                    }
                    _ => {
                        debug!(error = %err, %source, "dropping malformed message");
                        self.metrics.record_absorbed();
                    }
                }
                return;
            }
        };

        let Some(id) = TransactionId::for_message(&message) else {
            debug!(message = %message.brief(), "dropping message without a transaction id");
            self.metrics.record_absorbed();
            return;
        };

        match message {
            SipMessage::Request(request) => self.on_wire_request(id, request, source),
            SipMessage::Response(response) => self.on_wire_response(id, response),
        }
    }

    fn on_wire_request(&mut self, id: TransactionId, request: Request, source: Target) {
        let method = request.method().clone();
        let key = if method.is_cancel() {
            TransactionKey::server(id.cancel_id())
        } else {
            TransactionKey::server(id.clone())
        };

        let existing = self
            .server
            .find(&key.id)
            .map(|r| (r.method().clone(), r.ack_is_valid, r.is_reliable()));

        let Some((record_method, ack_is_valid, reliable)) = existing else {
            self.new_server_transaction(key, id, request, source);
            return;
        };

        if method.is_ack() && !ack_is_valid {
            info!(
                id = %key.id,
                "ACK reuses the INVITE's transaction id; passing it on statelessly"
            );
            self.deliver_stray_ack(key, request);
            return;
        }
        if !method_matches(&record_method, &method) {
            if method.is_ack() {
                info!(id = %key.id, %method, %record_method, "dropping ACK with colliding transaction id");
                self.metrics.record_absorbed();
            } else {
                info!(id = %key.id, %method, %record_method, "transaction id collision");
                self.reply_statelessly(
                    &request,
                    source,
                    400,
                    Some("Transaction Identifier Collision"),
                );
            }
            return;
        }
        if reliable && !method.is_ack() {
            info!(
                id = %key.id,
                "repeated transaction id over a reliable transport; discarding request"
            );
            self.metrics.record_absorbed();
            return;
        }

        self.run(&key, Input::Wire(request.into()));
    }

    fn new_server_transaction(
        &mut self,
        key: TransactionKey,
        invite_id: TransactionId,
        request: Request,
        source: Target,
    ) {
        let method = request.method().clone();
        if method.is_ack() {
            self.deliver_stray_ack(key, request);
            return;
        }

        if method.is_cancel() {
            let invite = self
                .server
                .find(&invite_id)
                .map(|r| (r.owner(), r.response_target, r.is_reliable()));
            let Some((owner, response_target, reliable)) = invite else {
                info!(id = %invite_id, "no server INVITE for CANCEL");
                self.reply_statelessly(&request, source, 481, None);
                return;
            };

            let mut record = self.create(
                key,
                Machine::ServerNonInvite,
                State::Trying,
                Method::Cancel,
                owner,
            );
            record.response_target = response_target;
            record.is_reliable = reliable;
            self.start_server_trying(&mut record, &request);
            self.send_to_tu(&mut record, request.into(), Origin::Wire);
            self.checkin(record);
            return;
        }

        let Some(owner) = self.tu.select_owner(&request) else {
            info!(id = %key.id, %method, "no TU for request");
            self.reply_statelessly(&request, source, 500, None);
            return;
        };

        let response_target = response_target_for(&request, source);
        let machine = if method.is_invite() {
            Machine::ServerInvite
        } else {
            Machine::ServerNonInvite
        };
        let mut record = self.create(key, machine, State::Trying, method, owner);
        record.response_target = Some(response_target);
        record.is_reliable = response_target.is_reliable();

        if machine == Machine::ServerInvite {
            record.next_transmission = Some(make_response(&request, 100, None).into());
            let t100 = self.config.timers.t100;
            if t100.is_zero() {
                self.send_current_to_wire(&mut record);
                record.state = State::Proceeding;
            } else {
                self.arm(&record, TimerKind::Trying, t100);
            }
        } else {
            self.start_server_trying(&mut record, &request);
        }

        self.send_to_tu(&mut record, request.into(), Origin::Wire);
        self.checkin(record);
    }

    /// Stores a 100 for a server non-INVITE and arms the delay after which it
    /// is sent if the TU has not answered.
    fn start_server_trying(&mut self, record: &mut TransactionRecord, request: &Request) {
        record.next_transmission = Some(make_response(request, 100, None).into());
        record.retransmit = None;
        let delay = self.config.timers.non_invite_trying();
        self.arm(record, TimerKind::Trying, delay);
    }

    fn on_wire_response(&mut self, id: TransactionId, response: Response) {
        let method = response.cseq_method();
        let key = match &method {
            Some(m) if m.is_cancel() => TransactionKey::client(id.cancel_id()),
            _ => TransactionKey::client(id),
        };

        let record_method = self.client.find(&key.id).map(|r| r.method().clone());
        match record_method {
            Some(record_method) => {
                if !method
                    .as_ref()
                    .map(|m| method_matches(&record_method, m))
                    .unwrap_or(false)
                {
                    info!(
                        id = %key.id,
                        %record_method,
                        code = response.code(),
                        "dropping response whose method does not match its transaction"
                    );
                    self.metrics.record_absorbed();
                    return;
                }
                self.run(&key, Input::Wire(response.into()));
            }
            None => self.on_stray_response(response),
        }
    }

    fn on_stray_response(&mut self, response: Response) {
        if self.config.discard_stray_responses {
            info!(code = response.code(), "discarding stray response");
            self.metrics.record_absorbed();
            return;
        }

        self.stateless_counter += 1;
        let key = TransactionKey::client(TransactionId::new(format!(
            "stateless-{}",
            self.stateless_counter
        )));
        debug!(id = %key.id, code = response.code(), "forwarding stray response");
        let method = response
            .cseq_method()
            .unwrap_or_else(|| Method::Unknown(SmolStr::default()));
        let mut record = self.create(
            key,
            Machine::Stateless,
            State::Calling,
            method,
            TuId::DEFAULT,
        );
        self.arm(&record, TimerKind::Stateless, self.config.timers.ts);
        self.process(&mut record, Input::Wire(response.into()));
        self.checkin(record);
    }

    /// An ACK with no transaction to absorb it: an ACK for a 2xx, or one
    /// arriving after its INVITE record is gone.
    fn deliver_stray_ack(&mut self, key: TransactionKey, ack: Request) {
        let owner = self.tu.select_owner(&ack).unwrap_or(TuId::DEFAULT);
        if self.tu.rejection_behavior(owner) == RejectionBehavior::RejectingNonEssential {
            debug!(id = %key.id, ?owner, "TU congested; dropping ACK");
            self.metrics.record_absorbed();
            return;
        }
        trace!(id = %key.id, ?owner, "passing ACK to TU");
        self.tu.deliver(owner, &key, ack.into());
    }

    fn on_application(&mut self, app: AppMessage) {
        let AppMessage {
            message,
            owner,
            destination,
        } = app;
        let Some(id) = TransactionId::for_message(&message) else {
            warn!(message = %message.brief(), "TU message without a transaction id");
            return;
        };

        match message {
            SipMessage::Request(request) if request.method().is_cancel() => {
                self.cancel_client_invite(id, Some(request), Some(owner));
            }
            SipMessage::Request(request) => self.on_tu_request(id, request, owner, destination),
            SipMessage::Response(response) => {
                let key = match response.cseq_method() {
                    Some(m) if m.is_cancel() => TransactionKey::server(id.cancel_id()),
                    _ => TransactionKey::server(id),
                };
                if self.server.find(&key.id).is_none() {
                    debug!(id = %key.id, code = response.code(), "no server transaction for TU response");
                    self.metrics.record_absorbed();
                    return;
                }
                self.run(&key, Input::Tu(response.into()));
            }
        }
    }

    fn on_tu_request(
        &mut self,
        id: TransactionId,
        request: Request,
        owner: TuId,
        destination: Option<Target>,
    ) {
        let key = TransactionKey::client(id);
        if self.client.find(&key.id).is_some() {
            self.run(&key, Input::Tu(request.into()));
            return;
        }

        let method = request.method().clone();
        let (machine, state) = if method.is_ack() {
            (Machine::Stateless, State::Calling)
        } else if method.is_invite() {
            (Machine::ClientInvite, State::Calling)
        } else {
            (Machine::ClientNonInvite, State::Trying)
        };

        let mut record = self.create(key, machine, state, method, owner);
        record.next_transmission = Some(request.into());
        if let Some(destination) = destination {
            self.adopt_target(&mut record, destination);
        }
        let timers = self.config.timers;
        match machine {
            Machine::Stateless => self.arm(&record, TimerKind::Stateless, timers.ts),
            Machine::ClientInvite => self.arm(&record, TimerKind::B, timers.transaction_timeout()),
            _ => self.arm(&record, TimerKind::F, timers.transaction_timeout()),
        }
        self.send_current_to_wire(&mut record);
        self.checkin(record);
    }

    /// Cancels the client INVITE `invite_id`.
    ///
    /// `cancel` is the TU's own CANCEL, if it sent one; otherwise one is
    /// built from the INVITE.
    fn cancel_client_invite(
        &mut self,
        invite_id: TransactionId,
        cancel: Option<Request>,
        owner: Option<TuId>,
    ) {
        let invite_key = TransactionKey::client(invite_id);
        let is_invite = self
            .client
            .find(&invite_key.id)
            .map(|r| matches!(r.machine(), Machine::ClientInvite | Machine::ClientStale))
            .unwrap_or(false);

        if !is_invite {
            info!(id = %invite_key.id, "no client INVITE to cancel");
            if let (Some(cancel), Some(owner)) = (cancel, owner) {
                let response = make_response(&cancel, 481, None);
                let key = TransactionKey::client(invite_key.id.cancel_id());
                self.tu.deliver(owner, &key, response.into());
            }
            return;
        }

        let Some(mut invite) = self.checkout(&invite_key) else {
            return;
        };
        match invite.state {
            State::Calling => {
                warn!(
                    id = %invite_key.id,
                    "CANCEL deferred until a provisional response arrives"
                );
                invite.is_abandoned = true;
            }
            State::Proceeding => self.send_cancel(&mut invite, cancel),
            _ => {
                let cancel = cancel.or_else(|| invite.request().map(sip_core::helpers::make_cancel));
                if let Some(cancel) = cancel {
                    let response = make_response(&cancel, 200, None);
                    let key = TransactionKey::client(invite_key.id.cancel_id());
                    self.tu.deliver(invite.owner(), &key, response.into());
                }
            }
        }
        self.checkin(invite);
    }

    /// Starts the CANCEL transaction for a client INVITE in `Proceeding` and
    /// gives the INVITE `128*T1` to finish.
    pub(crate) fn send_cancel(&mut self, invite: &mut TransactionRecord, cancel: Option<Request>) {
        let Some(cancel) = cancel.or_else(|| invite.request().map(sip_core::helpers::make_cancel))
        else {
            warn!(id = %invite.key().id, "client INVITE lost its request; cannot CANCEL");
            return;
        };

        let key = TransactionKey::client(invite.key().id.cancel_id());
        if self.client.find(&key.id).is_some() {
            debug!(id = %key.id, "CANCEL already in progress");
            return;
        }

        debug!(id = %key.id, "sending CANCEL");
        let mut record = self.create(
            key,
            Machine::ClientNonInvite,
            State::Trying,
            Method::Cancel,
            invite.owner(),
        );
        record.next_transmission = Some(cancel.into());
        if let Some(target) = invite.target() {
            self.adopt_target(&mut record, target);
        }
        self.arm(&record, TimerKind::F, self.config.timers.transaction_timeout());
        self.send_current_to_wire(&mut record);
        self.checkin(record);

        self.arm(invite, TimerKind::CleanUp, self.config.timers.cleanup());
    }

    // ----- record lifecycle -----

    fn create(
        &mut self,
        key: TransactionKey,
        machine: Machine,
        state: State,
        method: Method,
        owner: TuId,
    ) -> TransactionRecord {
        self.next_serial += 1;
        self.metrics.record_created(machine);
        debug!(id = %key.id, ?machine, %method, ?owner, "new transaction");
        TransactionRecord::new(
            self.next_serial,
            key,
            machine,
            state,
            method,
            owner,
            self.clock.now(),
        )
    }

    fn table_mut(&mut self, side: Side) -> &mut TransactionTable {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn checkout(&mut self, key: &TransactionKey) -> Option<TransactionRecord> {
        self.table_mut(key.side).erase(&key.id)
    }

    fn checkin(&mut self, record: TransactionRecord) {
        if record.state() == State::Terminated {
            trace!(id = %record.key().id, "transaction destroyed");
            return;
        }
        let side = record.key().side;
        self.table_mut(side).insert(record);
    }

    /// Runs one machine step on the record under `key`.
    fn run(&mut self, key: &TransactionKey, input: Input) {
        let Some(mut record) = self.checkout(key) else {
            return;
        };
        self.process(&mut record, input);
        self.checkin(record);
    }

    pub(crate) fn process(&mut self, record: &mut TransactionRecord, input: Input) {
        trace!(id = %record.key().id, machine = ?record.machine(), state = ?record.state(), ?input, "process");
        match record.machine() {
            Machine::ClientNonInvite => self.process_client_non_invite(record, input),
            Machine::ClientInvite => self.process_client_invite(record, input),
            Machine::ServerNonInvite => self.process_server_non_invite(record, input),
            Machine::ServerInvite => self.process_server_invite(record, input),
            Machine::ClientStale => self.process_client_stale(record, input),
            Machine::ServerStale => self.process_server_stale(record, input),
            Machine::Stateless => self.process_stateless(record, input),
        }
    }

    /// Moves a record to `Terminated`. The record is dropped when its step
    /// ends.
    pub(crate) fn terminate(&mut self, record: &mut TransactionRecord, outcome: TransactionOutcome) {
        if record.state() == State::Terminated {
            return;
        }
        record.state = State::Terminated;
        record.retransmit = None;
        let lifetime = self.clock.now().saturating_duration_since(record.created);
        self.metrics
            .record_terminated(record.method().as_str(), outcome, lifetime);
        debug!(id = %record.key().id, ?outcome, ?lifetime, "transaction terminated");

        if record.machine() != Machine::Stateless && self.tu.wants_termination_notices(record.owner()) {
            self.tu.notify_terminated(record.owner(), record.key());
        }
    }

    // ----- timers -----

    pub(crate) fn arm(&mut self, record: &TransactionRecord, kind: TimerKind, delay: Duration) {
        let now = self.clock.now();
        trace!(id = %record.key().id, ?kind, ?delay, "arm timer");
        self.timers
            .schedule(kind, record.key().clone(), record.serial(), delay, now);
    }

    fn on_timer(&mut self, timer: Timer) {
        let Some(mut record) = self.checkout(&timer.key) else {
            trace!(id = %timer.key.id, kind = ?timer.kind, "timer for a finished transaction");
            return;
        };
        if record.serial() != timer.serial {
            trace!(id = %timer.key.id, kind = ?timer.kind, "timer for a replaced transaction");
            self.checkin(record);
            return;
        }

        self.metrics.record_timer_fired(timer.kind);
        if self.rejection == RejectionBehavior::RejectingNonEssential && timer.kind.is_retransmit() {
            self.defer_retransmit(&record, &timer);
        } else {
            self.process(&mut record, Input::Timer(timer));
        }
        self.checkin(record);
    }

    /// Re-arms a retransmit timer without resending while the engine sheds
    /// load.
    fn defer_retransmit(&mut self, record: &TransactionRecord, timer: &Timer) {
        let t2 = self.config.timers.t2;
        let delay = match timer.kind {
            TimerKind::A => timer.delay.saturating_mul(2),
            TimerKind::E1 | TimerKind::G => timer.delay.saturating_mul(2).min(t2),
            TimerKind::E2 => t2,
            other => unreachable!("{other:?} is not a retransmit timer"),
        };
        debug!(id = %timer.key.id, kind = ?timer.kind, ?delay, "congested; retransmission deferred");
        self.arm(record, timer.kind, delay);
    }

    // ----- wire -----

    /// Sends the record's current message: resends the buffered copy if one
    /// is held, otherwise transmits `next_transmission`, resolving a client
    /// target first if none is known.
    pub(crate) fn send_current_to_wire(&mut self, record: &mut TransactionRecord) {
        if let Some(retransmission) = record.retransmit.as_ref() {
            trace!(id = %record.key().id, target = %retransmission.target, "retransmit");
            self.transport
                .retransmit(record.key(), &retransmission.message, &retransmission.target);
            self.metrics.record_retransmission();
            return;
        }

        let Some(message) = record.next_transmission.clone() else {
            debug!(id = %record.key().id, "nothing to send");
            return;
        };

        let target = if record.key().is_client() {
            match record.target() {
                Some(target) => target,
                None => {
                    self.start_resolution(record);
                    return;
                }
            }
        } else {
            match record.response_target {
                Some(target) => target,
                None => {
                    warn!(id = %record.key().id, "server transaction without a response target");
                    return;
                }
            }
        };
        self.transmit(record, message, target);
    }

    /// Hands `message` to the transport and, on unreliable transports, keeps
    /// it for retransmission.
    pub(crate) fn transmit(&mut self, record: &mut TransactionRecord, message: SipMessage, target: Target) {
        trace!(id = %record.key().id, %target, message = %message.brief(), "transmit");
        if self.transport.transmit(record.key(), &message, &target) == TransmitState::Unsent {
            debug!(id = %record.key().id, %target, "transport did not accept message");
        }
        if !record.is_reliable() {
            record.retransmit = Some(Retransmission { message, target });
        }
    }

    /// Clears the retransmit buffer and makes `message` the one to send.
    pub(crate) fn reset_next_transmission(&mut self, record: &mut TransactionRecord, message: SipMessage) {
        record.next_transmission = Some(message);
        record.retransmit = None;
    }

    /// Points a client record at `target`, arming its first retransmit timer
    /// when this makes it unreliable. Returns whether a timer was armed.
    fn adopt_target(&mut self, record: &mut TransactionRecord, target: Target) -> bool {
        if !record.set_target(target) {
            return false;
        }
        let t1 = self.config.timers.t1;
        match record.machine() {
            Machine::ClientNonInvite => {
                self.arm(record, TimerKind::E1, t1);
                true
            }
            Machine::ClientInvite => {
                self.arm(record, TimerKind::A, t1);
                true
            }
            _ => false,
        }
    }

    fn start_resolution(&mut self, record: &mut TransactionRecord) {
        if record.resolution.is_some() {
            debug!(id = %record.key().id, "resolution already in progress");
            return;
        }
        let Some(request) = record.request() else {
            return;
        };
        debug!(id = %record.key().id, uri = request.uri(), "resolving target");
        let resolution = self.transport.resolve(record.key(), request);
        record.resolution = Some(ResolutionHandle::new(resolution));
        record.pending_dns = true;
        self.advance_target(record);
    }

    /// Moves to the resolution's next target, waits for one, or gives up.
    fn advance_target(&mut self, record: &mut TransactionRecord) {
        let availability = record
            .resolution
            .as_mut()
            .map(|r| r.availability())
            .unwrap_or(Availability::Finished);

        match availability {
            Availability::Available => {
                record.pending_dns = false;
                match record.resolution.as_mut().and_then(|r| r.next()) {
                    Some(target) => {
                        debug!(id = %record.key().id, %target, "trying target");
                        record.retransmit = None;
                        let armed = self.adopt_target(record, target);
                        if std::mem::take(&mut record.restart_timer_a)
                            && !armed
                            && !record.is_reliable()
                        {
                            self.arm(record, TimerKind::A, self.config.timers.t1);
                        }
                        self.send_current_to_wire(record);
                    }
                    None => self.process_no_dns_results(record),
                }
            }
            Availability::Pending => {
                debug!(id = %record.key().id, "waiting for DNS");
                record.pending_dns = true;
                record.retransmit = None;
            }
            Availability::Finished => {
                record.pending_dns = false;
                self.process_no_dns_results(record);
            }
        }
    }

    fn on_dns_completed(&mut self, key: &TransactionKey) {
        let Some(mut record) = self.checkout(key) else {
            trace!(id = %key.id, "DNS result for a finished transaction");
            return;
        };
        if record.pending_dns {
            self.advance_target(&mut record);
        } else {
            trace!(id = %key.id, "DNS result not awaited");
        }
        self.checkin(record);
    }

    fn on_transport_failure(&mut self, key: &TransactionKey, failure: TransportFailure) {
        let Some(mut record) = self.checkout(key) else {
            debug!(id = %key.id, reason = %failure.reason, "transport failure for a finished transaction");
            return;
        };
        record.note_failure(failure);
        self.process_transport_failure(&mut record);
        self.checkin(record);
    }

    fn process_transport_failure(&mut self, record: &mut TransactionRecord) {
        let failure = record.failure();
        info!(
            id = %record.key().id,
            machine = ?record.machine(),
            state = ?record.state(),
            reason = %failure.reason,
            sub_code = failure.sub_code,
            "transport failure"
        );

        match record.machine() {
            Machine::ServerNonInvite | Machine::ServerInvite | Machine::ServerStale => {
                self.terminate(record, TransactionOutcome::TransportError);
                return;
            }
            Machine::Stateless => {
                self.terminate(record, TransactionOutcome::TransportError);
                return;
            }
            Machine::ClientStale => return,
            Machine::ClientNonInvite | Machine::ClientInvite => {}
        }

        if matches!(record.state(), State::Completed | State::Terminated) {
            debug!(id = %record.key().id, "transaction already completed; not failing over");
            return;
        }

        if record.method().is_cancel() {
            warn!(id = %record.key().id, "failed to deliver CANCEL");
            if let Some(request) = record.request() {
                let mut response = make_response(request, 503, None);
                response.headers_mut().push(
                    "Warning",
                    warning_value(
                        399,
                        &self.config.agent,
                        "Failed to deliver CANCEL using the same transport as the INVITE was used",
                    ),
                );
                self.send_to_tu(record, response.into(), Origin::Internal);
            }
            self.terminate(record, TransactionOutcome::TransportError);
            return;
        }

        let until = self.clock.now() + self.config.timers.greylist;
        match record.resolution.as_mut() {
            Some(resolution) => resolution.greylist_last(until),
            None => {
                self.process_no_dns_results(record);
                return;
            }
        }

        if record.machine() == Machine::ClientInvite && record.state() == State::Proceeding {
            record.state = State::Calling;
            record.restart_timer_a = true;
        }
        self.advance_target(record);
    }

    /// Every target failed: tells the TU with a 503 and terminates.
    fn process_no_dns_results(&mut self, record: &mut TransactionRecord) {
        let failure = record.failure();
        let used_dns = record.resolution.is_some();
        let response = match record.request() {
            Some(request) if !request.method().is_ack() => {
                no_targets_response(request, failure, used_dns, &self.config.agent)
            }
            _ => return,
        };

        info!(
            id = %record.key().id,
            code = response.code(),
            reason = response.reason(),
            "no targets left"
        );
        self.send_to_tu(record, response.into(), Origin::Internal);
        self.terminate(record, TransactionOutcome::DnsExhausted);
    }

    /// Answers a request without creating a record.
    fn reply_statelessly(&self, request: &Request, source: Target, code: u16, reason: Option<&str>) {
        let response: SipMessage = make_response(request, code, reason).into();
        let target = response_target_for(request, source);
        let id = TransactionId::for_message(&response)
            .unwrap_or_else(|| TransactionId::new("stateless"));
        debug!(%id, code, %target, "stateless response");
        let key = TransactionKey::server(id);
        if self.transport.transmit(&key, &response, &target) == TransmitState::Unsent {
            debug!(id = %key.id, %target, "transport did not accept stateless response");
        }
    }

    // ----- TU -----

    /// Hands a message to the record's owner, applying DNS feedback for
    /// responses and the owner's congestion policy.
    pub(crate) fn send_to_tu(&mut self, record: &mut TransactionRecord, message: SipMessage, origin: Origin) {
        if let SipMessage::Response(response) = &message {
            self.dns_feedback(record, response, origin);
        }

        let owner = record.owner();
        let behavior = self.tu.rejection_behavior(owner);
        if behavior != RejectionBehavior::Normal {
            match &message {
                SipMessage::Request(request) if request.method().is_ack() => {
                    if behavior == RejectionBehavior::RejectingNonEssential {
                        debug!(id = %record.key().id, "TU congested; dropping ACK");
                        self.metrics.record_absorbed();
                        return;
                    }
                }
                SipMessage::Request(request) => {
                    let mut response = make_response(request, 503, None);
                    response.headers_mut().push(
                        "Retry-After",
                        self.tu.expected_wait_secs(owner).to_string(),
                    );
                    info!(id = %record.key().id, ?owner, "TU congested; rejecting new request");
                    self.metrics.record_congestion_rejection();
                    self.process(record, Input::Tu(response.into()));
                    return;
                }
                SipMessage::Response(response) => {
                    if behavior == RejectionBehavior::RejectingNonEssential
                        && !self.tu.responses_mandatory(owner)
                    {
                        debug!(id = %record.key().id, code = response.code(), "TU congested; dropping response");
                        self.metrics.record_absorbed();
                        return;
                    }
                }
            }
        }

        self.tu.deliver(owner, record.key(), message);
    }

    fn dns_feedback(&mut self, record: &mut TransactionRecord, response: &Response, origin: Origin) {
        let now = self.clock.now();
        let greylist = self.config.timers.greylist;
        let state = record.state();
        let Some(resolution) = record.resolution.as_mut() else {
            return;
        };
        match response.code() {
            503 => {
                if let Some(secs) = response.headers().retry_after().filter(|s| *s != 0) {
                    resolution.blacklist_last(now + Duration::from_secs(u64::from(secs)));
                }
            }
            408 => {
                if origin == Origin::Internal && matches!(state, State::Trying | State::Calling) {
                    resolution.greylist_last(now + greylist);
                }
            }
            _ => resolution.whitelist_last(),
        }
    }

    // ----- stateless machine -----

    fn process_stateless(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Tu(message) => {
                self.reset_next_transmission(record, message);
                self.send_current_to_wire(record);
            }
            Input::Wire(message) => {
                info!(id = %record.key().id, message = %message.brief(), "message from wire on a stateless transaction");
                self.send_to_tu(record, message, Origin::Wire);
            }
            Input::Timer(timer) if timer.kind == TimerKind::Stateless => {
                self.terminate(record, TransactionOutcome::Completed);
            }
            other => {
                debug!(id = %record.key().id, input = ?other, "ignored by stateless transaction");
            }
        }
    }
}

/// Whether a message of `method` belongs to a record created for
/// `record_method`. An INVITE record also takes its ACK.
fn method_matches(record_method: &Method, method: &Method) -> bool {
    if record_method.is_invite() {
        method.is_invite() || method.is_ack()
    } else {
        record_method == method
    }
}

/// Where responses to `request`, received from `source`, are sent.
///
/// Reliable transports and requests with `rport` answer the source port;
/// otherwise the Via sent-by port, or the transport's default.
pub(crate) fn response_target_for(request: &Request, source: Target) -> Target {
    if source.is_reliable() {
        return source;
    }
    match request.headers().top_via() {
        Some(via) if via.has_rport() => source,
        Some(via) => {
            let port = via.port().unwrap_or_else(|| {
                Transport::from_token(via.transport())
                    .unwrap_or(Transport::Udp)
                    .default_port()
            });
            source.with_port(port)
        }
        None => source,
    }
}

fn no_targets_response(
    request: &Request,
    failure: TransportFailure,
    used_dns: bool,
    agent: &str,
) -> Response {
    let mut response = make_response(request, 503, Some(failure.reason.exhausted_reason()));
    let mut text = if used_dns {
        format!(
            "No other DNS entries to try ({},{})",
            failure.reason, failure.sub_code
        )
    } else {
        format!("Transport failure ({},{})", failure.reason, failure.sub_code)
    };
    if failure.reason == FailureReason::FlowGone {
        response.set_status(430, "Flow failed");
        text = "Flow no longer exists".to_string();
    }
    response
        .headers_mut()
        .push("Warning", warning_value(399, agent, &text));
    response
}

/// Synthesized final response for a client transaction that ran out of time.
pub(crate) fn timeout_response(request: &Request, pending_dns: bool) -> Response {
    if pending_dns {
        make_response(request, 503, Some("DNS Timeout"))
    } else {
        make_response(request, 408, None)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bytes::Bytes;
    use sip_core::{Headers, RequestLine};

    use super::*;

    fn request(via: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("From", "<sip:alice@example.com>;tag=a");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "c1");
        headers.push("CSeq", "1 OPTIONS");
        Request::new(
            RequestLine::new(Method::Options, "sip:bob@example.com"),
            headers,
            Bytes::new(),
        )
        .expect("request")
    }

    fn source(transport: Transport) -> Target {
        let addr: SocketAddr = "192.0.2.7:40000".parse().expect("addr");
        Target::new(addr, transport)
    }

    #[test]
    fn reliable_responses_go_to_the_source_port() {
        let req = request("SIP/2.0/TCP client.example.com:5070;branch=z9hG4bK1");
        let target = response_target_for(&req, source(Transport::Tcp));
        assert_eq!(target.addr.port(), 40000);
    }

    #[test]
    fn rport_answers_the_source_port() {
        let req = request("SIP/2.0/UDP client.example.com:5070;rport;branch=z9hG4bK1");
        assert_eq!(response_target_for(&req, source(Transport::Udp)).addr.port(), 40000);
    }

    #[test]
    fn udp_without_rport_uses_the_via_port() {
        let req = request("SIP/2.0/UDP client.example.com:5070;branch=z9hG4bK1");
        assert_eq!(response_target_for(&req, source(Transport::Udp)).addr.port(), 5070);

        let req = request("SIP/2.0/UDP client.example.com;branch=z9hG4bK1");
        assert_eq!(response_target_for(&req, source(Transport::Udp)).addr.port(), 5060);
    }

    #[test]
    fn invite_records_accept_their_ack() {
        assert!(method_matches(&Method::Invite, &Method::Ack));
        assert!(!method_matches(&Method::Options, &Method::Ack));
        assert!(!method_matches(&Method::Invite, &Method::Bye));
        assert!(method_matches(&Method::Bye, &Method::Bye));
    }

    #[test]
    fn flow_failures_map_to_430() {
        let req = request("SIP/2.0/UDP client.example.com;branch=z9hG4bK1");
        let response = no_targets_response(
            &req,
            TransportFailure::new(FailureReason::FlowGone),
            false,
            "proxy.example.com",
        );
        assert_eq!(response.code(), 430);
        assert_eq!(response.reason(), "Flow failed");
        assert!(response
            .headers()
            .get("Warning")
            .map(|w| w.contains("Flow no longer exists"))
            .unwrap_or(false));
    }

    #[test]
    fn exhausted_dns_warning_names_the_failure() {
        let req = request("SIP/2.0/UDP client.example.com;branch=z9hG4bK1");
        let mut failure = TransportFailure::new(FailureReason::NoRoute);
        failure.sub_code = 113;
        let response = no_targets_response(&req, failure, true, "proxy.example.com");
        assert_eq!(response.code(), 503);
        assert_eq!(response.reason(), "No route to host");
        assert_eq!(
            response.headers().get("Warning").map(|w| w.as_str()),
            Some("399 proxy.example.com \"No other DNS entries to try (NoRoute,113)\"")
        );
    }

    #[test]
    fn dns_timeout_is_a_503() {
        let req = request("SIP/2.0/UDP client.example.com;branch=z9hG4bK1");
        assert_eq!(timeout_response(&req, true).reason(), "DNS Timeout");
        assert_eq!(timeout_response(&req, false).code(), 408);
    }
}
