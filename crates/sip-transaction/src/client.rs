// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client transaction machines (RFC 3261 §17.1).

use sip_core::{helpers::make_failure_ack, Response, SipMessage};
use tracing::{debug, trace};

use crate::{
    engine::{timeout_response, Engine, Input, Origin},
    metrics::TransactionOutcome,
    record::{State, TransactionRecord},
    timers::{Timer, TimerKind},
};

impl Engine {
    /// Figure 6: non-INVITE client transaction.
    pub(crate) fn process_client_non_invite(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Wire(SipMessage::Response(response)) => {
                let in_flight = matches!(record.state(), State::Trying | State::Proceeding);
                if !in_flight {
                    trace!(id = %record.key().id, code = response.code(), "absorbing late response");
                    self.metrics().record_absorbed();
                    return;
                }

                if response.is_provisional() {
                    if !record.is_reliable() && record.state() == State::Trying {
                        self.arm(record, TimerKind::E2, self.config().timers.t2);
                    }
                    record.state = State::Proceeding;
                    self.send_to_tu(record, response.into(), Origin::Wire);
                    return;
                }

                self.send_to_tu(record, response.into(), Origin::Wire);
                if record.is_reliable() {
                    self.terminate(record, TransactionOutcome::Completed);
                } else {
                    record.state = State::Completed;
                    self.arm(record, TimerKind::K, self.config().timers.t4);
                    record.release_dns();
                    record.retransmit = None;
                }
            }
            Input::Timer(timer) => self.client_non_invite_timer(record, timer),
            other => {
                debug!(id = %record.key().id, input = ?other, "ignored by non-INVITE client transaction");
            }
        }
    }

    fn client_non_invite_timer(&mut self, record: &mut TransactionRecord, timer: Timer) {
        let timers = self.config().timers;
        match (timer.kind, record.state()) {
            (TimerKind::E1, State::Trying) => {
                self.resend(record);
                self.arm(record, TimerKind::E1, timer.delay.saturating_mul(2).min(timers.t2));
            }
            (TimerKind::E2, State::Proceeding) => {
                self.resend(record);
                self.arm(record, TimerKind::E2, timers.t2);
            }
            (TimerKind::F, State::Trying | State::Proceeding) => self.time_out(record),
            (TimerKind::K, _) => self.terminate(record, TransactionOutcome::Completed),
            (kind, state) => trace!(id = %record.key().id, ?kind, ?state, "stale timer"),
        }
    }

    /// Figure 5: INVITE client transaction.
    pub(crate) fn process_client_invite(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Wire(SipMessage::Response(response)) => {
                if response.is_provisional() {
                    self.client_invite_provisional(record, response);
                } else if response.is_success() {
                    self.client_invite_success(record, response);
                } else {
                    self.client_invite_failure(record, response);
                }
            }
            Input::Timer(timer) => self.client_invite_timer(record, timer),
            other => {
                debug!(id = %record.key().id, input = ?other, "ignored by INVITE client transaction");
            }
        }
    }

    fn client_invite_provisional(&mut self, record: &mut TransactionRecord, response: Response) {
        if !matches!(record.state(), State::Calling | State::Proceeding) {
            trace!(id = %record.key().id, code = response.code(), "absorbing late provisional");
            self.metrics().record_absorbed();
            return;
        }

        record.state = State::Proceeding;
        if record.is_abandoned {
            record.is_abandoned = false;
            self.send_cancel(record, None);
        }
        // The INVITE stays in next_transmission for building the ACK/CANCEL.
        record.retransmit = None;
        self.send_to_tu(record, response.into(), Origin::Wire);
    }

    fn client_invite_success(&mut self, record: &mut TransactionRecord, response: Response) {
        if !matches!(record.state(), State::Calling | State::Proceeding) {
            trace!(id = %record.key().id, code = response.code(), "absorbing 2xx");
            self.metrics().record_absorbed();
            return;
        }

        self.send_to_tu(record, response.into(), Origin::Wire);
        record.become_stale();
        record.state = State::Completed;
        record.retransmit = None;
        record.release_dns();
        self.arm(record, TimerKind::StaleClient, self.config().timers.ts);
    }

    /// 3xx-6xx: the transaction layer ACKs these itself.
    fn client_invite_failure(&mut self, record: &mut TransactionRecord, response: Response) {
        match record.state() {
            State::Calling | State::Proceeding => {
                let ack = match record.request() {
                    Some(invite) => make_failure_ack(invite, &response),
                    None => {
                        debug!(id = %record.key().id, "client INVITE lost its request; cannot ACK");
                        return;
                    }
                };

                if record.is_reliable() {
                    if let Some(target) = record.target() {
                        self.transmit(record, ack.into(), target);
                    }
                    self.send_to_tu(record, response.into(), Origin::Wire);
                    self.terminate(record, TransactionOutcome::Completed);
                } else {
                    record.state = State::Completed;
                    self.arm(record, TimerKind::D, self.config().timers.td);
                    if let Some(target) = record.target() {
                        self.transmit(record, ack.into(), target);
                    }
                    self.send_to_tu(record, response.into(), Origin::Wire);
                }
            }
            State::Completed => {
                // Retransmitted failure: answer with the ACK already sent.
                debug!(id = %record.key().id, code = response.code(), "resending ACK");
                self.resend(record);
            }
            state => {
                trace!(id = %record.key().id, ?state, code = response.code(), "absorbing failure response");
                self.metrics().record_absorbed();
            }
        }
    }

    fn client_invite_timer(&mut self, record: &mut TransactionRecord, timer: Timer) {
        match (timer.kind, record.state()) {
            (TimerKind::A, State::Calling) if !record.is_abandoned() => {
                self.resend(record);
                self.arm(record, TimerKind::A, timer.delay.saturating_mul(2));
            }
            (TimerKind::B, State::Calling) => self.time_out(record),
            (TimerKind::D, _) => self.terminate(record, TransactionOutcome::Completed),
            (TimerKind::CleanUp, State::Proceeding) => {
                debug!(id = %record.key().id, "no final response after CANCEL");
                self.time_out(record);
            }
            (kind, state) => trace!(id = %record.key().id, ?kind, ?state, "stale timer"),
        }
    }

    /// Resends the buffered message, if there is one. Nothing is buffered
    /// while a failed-over record waits for DNS.
    fn resend(&mut self, record: &mut TransactionRecord) {
        if record.has_retransmission() {
            self.send_current_to_wire(record);
        }
    }

    /// Gives up on a client transaction: 408, or 503 when still waiting on
    /// DNS.
    fn time_out(&mut self, record: &mut TransactionRecord) {
        let pending_dns = record.pending_dns();
        let Some(response) = record
            .request()
            .map(|request| timeout_response(request, pending_dns))
        else {
            self.terminate(record, TransactionOutcome::Timeout);
            return;
        };

        debug!(id = %record.key().id, code = response.code(), "client transaction timed out");
        self.send_to_tu(record, response.into(), Origin::Internal);
        let outcome = if pending_dns {
            TransactionOutcome::DnsExhausted
        } else {
            TransactionOutcome::Timeout
        };
        self.terminate(record, outcome);
    }

    pub(crate) fn process_client_stale(&mut self, record: &mut TransactionRecord, input: Input) {
        match input {
            Input::Timer(timer) if timer.kind == TimerKind::StaleClient => {
                self.terminate(record, TransactionOutcome::Completed);
            }
            Input::Wire(SipMessage::Response(response)) if response.is_success() => {
                self.send_to_tu(record, response.into(), Origin::Wire);
            }
            other => {
                debug!(id = %record.key().id, input = ?other, "stale client transaction discarding message");
                self.metrics().record_absorbed();
            }
        }
    }
}
