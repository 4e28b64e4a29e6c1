// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server transaction machines (RFC 3261 §17.2).
//!
//! Both machines keep their latest response in `next_transmission` from the
//! start: the 100 Trying is built when the request arrives so a retransmitted
//! request can always be answered.

use sip_core::{
    helpers::{generate_tag, make_response},
    Response, SipMessage,
};
use smol_str::SmolStr;
use tracing::{debug, info, trace, warn};

use crate::{
    engine::{Engine, Input, Origin},
    metrics::TransactionOutcome,
    record::{State, TransactionRecord},
    timers::{Timer, TimerKind},
};

impl Engine {
    /// Figure 8: non-INVITE server transaction.
    pub(crate) fn process_server_non_invite(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Wire(SipMessage::Request(request)) => match record.state() {
                State::Trying => {
                    trace!(id = %record.key().id, "retransmission before any response; ignored");
                    self.metrics().record_absorbed();
                }
                State::Proceeding | State::Completed => {
                    if record.is_abandoned {
                        record.is_abandoned = false;
                        let response = make_response(&request, 500, None);
                        self.reset_next_transmission(record, response.into());
                    }
                    self.send_current_to_wire(record);
                }
                state => trace!(id = %record.key().id, ?state, "request ignored"),
            },
            Input::Tu(SipMessage::Response(response)) => {
                self.server_non_invite_response(record, response)
            }
            Input::Timer(timer) => match (timer.kind, record.state()) {
                (TimerKind::J, State::Completed) => {
                    self.terminate(record, TransactionOutcome::Completed)
                }
                (TimerKind::Trying, State::Trying) => {
                    self.send_current_to_wire(record);
                    record.state = State::Proceeding;
                }
                (kind, state) => trace!(id = %record.key().id, ?kind, ?state, "stale timer"),
            },
            Input::Abandon => {
                if !matches!(record.state(), State::Trying | State::Proceeding) {
                    return;
                }
                debug!(id = %record.key().id, "server transaction abandoned");
                record.is_abandoned = true;
                if record.is_reliable() {
                    self.terminate(record, TransactionOutcome::Abandoned);
                } else {
                    record.state = State::Completed;
                    self.arm(record, TimerKind::J, self.config().timers.transaction_timeout());
                }
            }
            other => {
                debug!(id = %record.key().id, input = ?other, "ignored by non-INVITE server transaction");
            }
        }
    }

    fn server_non_invite_response(&mut self, record: &mut TransactionRecord, response: Response) {
        let answering = matches!(record.state(), State::Trying | State::Proceeding);
        if response.is_provisional() {
            if answering {
                self.reset_next_transmission(record, response.into());
                record.state = State::Proceeding;
                self.send_current_to_wire(record);
            }
            return;
        }

        if record.is_reliable() {
            self.reset_next_transmission(record, response.into());
            self.send_current_to_wire(record);
            self.terminate(record, TransactionOutcome::Completed);
        } else if answering {
            record.state = State::Completed;
            self.arm(record, TimerKind::J, self.config().timers.transaction_timeout());
            self.reset_next_transmission(record, response.into());
            self.send_current_to_wire(record);
        } else {
            debug!(id = %record.key().id, code = response.code(), "final response already sent; dropping");
        }
    }

    /// Figure 7: INVITE server transaction.
    pub(crate) fn process_server_invite(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Wire(SipMessage::Request(request)) if request.method().is_invite() => {
                if record.is_abandoned {
                    record.is_abandoned = false;
                    let response = make_response(&request, 500, None);
                    self.reset_next_transmission(record, response.into());
                    self.complete_server_invite(record);
                    return;
                }
                if matches!(record.state(), State::Proceeding | State::Completed) {
                    self.send_current_to_wire(record);
                }
            }
            Input::Wire(SipMessage::Request(request)) if request.method().is_ack() => {
                if record.state() != State::Completed {
                    trace!(id = %record.key().id, state = ?record.state(), "ACK ignored");
                    self.metrics().record_absorbed();
                    return;
                }
                if record.is_reliable() {
                    self.terminate(record, TransactionOutcome::Completed);
                } else {
                    record.state = State::Confirmed;
                    self.arm(record, TimerKind::I, self.config().timers.t4);
                    record.next_transmission = None;
                    record.retransmit = None;
                }
            }
            Input::Tu(SipMessage::Response(response)) => self.server_invite_response(record, response),
            Input::Timer(timer) => self.server_invite_timer(record, timer),
            Input::Abandon => self.abandon_server_invite(record),
            other => {
                debug!(id = %record.key().id, input = ?other, "ignored by INVITE server transaction");
            }
        }
    }

    fn server_invite_response(&mut self, record: &mut TransactionRecord, response: Response) {
        if !matches!(record.state(), State::Trying | State::Proceeding) {
            debug!(id = %record.key().id, code = response.code(), state = ?record.state(), "late TU response dropped");
            return;
        }

        if response.is_provisional() {
            self.reset_next_transmission(record, response.into());
            record.state = State::Proceeding;
            self.send_current_to_wire(record);
        } else if response.is_success() {
            self.reset_next_transmission(record, response.into());
            self.send_current_to_wire(record);
            record.become_stale();
            self.arm(record, TimerKind::StaleServer, self.config().timers.ts);
        } else {
            self.reset_next_transmission(record, response.into());
            self.complete_server_invite(record);
        }
    }

    /// Sends the 3xx-6xx in `next_transmission` and waits for its ACK.
    fn complete_server_invite(&mut self, record: &mut TransactionRecord) {
        let timers = self.config().timers;
        record.ack_is_valid = true;
        record.state = State::Completed;
        self.arm(record, TimerKind::H, timers.transaction_timeout());
        if !record.is_reliable() {
            self.arm(record, TimerKind::G, timers.t1);
        }
        self.send_current_to_wire(record);
    }

    fn server_invite_timer(&mut self, record: &mut TransactionRecord, timer: Timer) {
        match (timer.kind, record.state()) {
            (TimerKind::G, State::Completed) => {
                self.send_current_to_wire(record);
                let delay = timer.delay.saturating_mul(2).min(self.config().timers.t2);
                self.arm(record, TimerKind::G, delay);
            }
            (TimerKind::H, _) => {
                warn!(id = %record.key().id, "no ACK received");
                self.terminate(record, TransactionOutcome::NoAck);
            }
            (TimerKind::I, _) => self.terminate(record, TransactionOutcome::Completed),
            (TimerKind::Trying, State::Trying) => {
                self.send_current_to_wire(record);
                record.state = State::Proceeding;
            }
            (kind, state) => trace!(id = %record.key().id, ?kind, ?state, "stale timer"),
        }
    }

    fn abandon_server_invite(&mut self, record: &mut TransactionRecord) {
        if !matches!(record.state(), State::Trying | State::Proceeding) || record.is_abandoned {
            return;
        }
        debug!(id = %record.key().id, "server INVITE abandoned");

        if let Some(SipMessage::Response(response)) = record.next_transmission.as_mut() {
            // The cached provisional becomes the final answer.
            response.set_status(500, "Server Error");
            if response.headers().to_tag().is_none() {
                if let Some(to) = response.headers_mut().get_mut("To") {
                    *to = SmolStr::new(format!("{};tag={}", to, generate_tag()));
                }
            }
            record.retransmit = None;
            self.complete_server_invite(record);
        } else if record.is_reliable() {
            self.terminate(record, TransactionOutcome::Abandoned);
        } else {
            record.is_abandoned = true;
        }
    }

    pub(crate) fn process_server_stale(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Timer(timer) if timer.kind == TimerKind::StaleServer => {
                self.terminate(record, TransactionOutcome::Completed);
            }
            Input::Wire(SipMessage::Request(request)) if request.method().is_ack() => {
                info!(id = %record.key().id, "passing ACK directly to TU");
                self.send_to_tu(record, request.into(), Origin::Wire);
            }
            Input::Wire(SipMessage::Request(request)) if request.method().is_invite() => {
                trace!(id = %record.key().id, "dropping retransmitted INVITE");
                self.metrics().record_absorbed();
            }
            Input::Tu(message @ SipMessage::Response(_)) => {
                self.reset_next_transmission(record, message);
                self.send_current_to_wire(record);
            }
            other => {
                info!(id = %record.key().id, input = ?other, "stale server transaction dropping message");
                self.metrics().record_absorbed();
            }
        }
    }
}
