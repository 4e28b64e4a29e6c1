// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server transactions driven end to end through the engine.

use std::time::Duration;

use sip_core::{Method, Request};
use sip_testkit::{
    build_cancel, build_failure_ack, build_invite, build_options, build_request,
    build_request_over, build_response, peer, server_key, Harness, Sent,
};
use sip_transaction::{
    Event, Machine, ParseError, ParseErrorKind, RejectionBehavior, State, TransactionConfig,
    TransactionId, TransactionOutcome, Transport, WireMessage,
};

fn codes(sent: &[Sent]) -> Vec<u16> {
    sent.iter().filter_map(Sent::code).collect()
}

fn abandon(h: &mut Harness, branch: &str) {
    h.engine.handle(Event::AbandonServer {
        id: server_key(branch).id,
    });
}

fn received(h: &Harness) -> Vec<Method> {
    h.tu.requests().iter().map(|r: &Request| r.method().clone()).collect()
}

// ===========================
// Non-INVITE
// ===========================

#[test]
fn non_invite_final_response_is_replayed_until_timer_j() {
    let mut h = Harness::new();
    let request = build_options("z9hG4bKnist1");
    let key = server_key("z9hG4bKnist1");

    h.receive(request.clone());
    assert_eq!(received(&h), vec![Method::Options]);

    h.send(build_response(&request, 200));
    h.receive(request.clone());

    let sent = h.transport.sent();
    assert_eq!(codes(&sent), vec![200, 200]);
    assert!(sent[1].retransmission);
    assert_eq!(sent[0].target, peer(Transport::Udp));
    assert_eq!(received(&h), vec![Method::Options]);

    h.advance(Duration::from_secs(32));
    assert!(h.engine.server_record(&key.id).is_none());
    assert!(h.tu.was_terminated(&key));
}

#[test]
fn delayed_100_trying_for_slow_non_invite() {
    let mut h = Harness::new();
    let request = build_options("z9hG4bKnist2");
    let key = server_key("z9hG4bKnist2");

    h.receive(request.clone());
    h.advance(Duration::from_secs(1));
    // Nothing to replay yet.
    h.receive(request.clone());
    assert!(h.transport.sent().is_empty());

    h.advance(Duration::from_millis(2_500));
    assert_eq!(codes(&h.transport.sent()), vec![100]);
    assert_eq!(
        h.engine.server_record(&key.id).map(|r| r.state()),
        Some(State::Proceeding)
    );

    h.receive(request.clone());
    h.send(build_response(&request, 202));
    assert_eq!(codes(&h.transport.sent()), vec![100, 100, 202]);
}

#[test]
fn final_response_over_tcp_terminates_at_once() {
    let mut h = Harness::new();
    let request = build_request_over(Method::Register, "z9hG4bKnist3", "TCP");
    let key = server_key("z9hG4bKnist3");

    h.receive_from(request.clone(), peer(Transport::Tcp));
    h.receive_from(request.clone(), peer(Transport::Tcp));
    assert_eq!(received(&h), vec![Method::Register]);

    h.send(build_response(&request, 200));
    assert_eq!(codes(&h.transport.sent()), vec![200]);
    assert!(h.engine.server_record(&key.id).is_none());
}

#[test]
fn abandoned_non_invite_answers_500_to_retransmissions() {
    let mut h = Harness::new();
    let request = build_options("z9hG4bKnist4");

    h.receive(request.clone());
    abandon(&mut h, "z9hG4bKnist4");
    assert!(h.transport.sent().is_empty());

    h.receive(request.clone());
    assert_eq!(codes(&h.transport.sent()), vec![500]);

    h.advance(Duration::from_secs(32));
    assert_eq!(
        h.engine
            .metrics()
            .snapshot()
            .outcome_count(TransactionOutcome::Completed),
        1
    );
}

// ===========================
// INVITE
// ===========================

#[test]
fn failure_response_retransmits_until_acked() {
    let mut h = Harness::new();
    let invite = build_invite("z9hG4bKist1");
    let key = server_key("z9hG4bKist1");

    h.receive(invite.clone());
    let busy = build_response(&invite, 486);
    h.send(busy.clone());
    h.advance(Duration::from_secs(2));
    assert_eq!(codes(&h.transport.sent()), vec![100, 486, 486, 486]);

    h.receive(build_failure_ack(&invite, &busy));
    let record = h.engine.server_record(&key.id).expect("confirmed");
    assert_eq!(record.state(), State::Confirmed);
    assert_eq!(received(&h), vec![Method::Invite]);

    h.advance(Duration::from_secs(5));
    assert!(h.engine.server_record(&key.id).is_none());
    assert_eq!(h.transport.sent().len(), 4);
}

#[test]
fn timer_h_gives_up_without_ack() {
    let mut h = Harness::new();
    let invite = build_invite("z9hG4bKist2");
    let key = server_key("z9hG4bKist2");

    h.receive(invite.clone());
    h.send(build_response(&invite, 480));
    h.advance(Duration::from_secs(32));

    let sent = codes(&h.transport.sent());
    assert_eq!(sent.iter().filter(|&&c| c == 480).count(), 11);
    assert!(h.engine.server_record(&key.id).is_none());
    assert!(h.tu.was_terminated(&key));
    assert_eq!(
        h.engine
            .metrics()
            .snapshot()
            .outcome_count(TransactionOutcome::NoAck),
        1
    );
}

#[test]
fn delayed_100_for_invite() {
    let config = TransactionConfig::from_json_str(r#"{ "t100_ms": 200 }"#).expect("config");
    let mut h = Harness::with_config(config);

    h.receive(build_invite("z9hG4bKist3"));
    assert!(h.transport.sent().is_empty());
    h.advance(Duration::from_millis(200));
    assert_eq!(codes(&h.transport.sent()), vec![100]);

    // A prompt TU answer makes the 100 unnecessary.
    let invite = build_invite("z9hG4bKist4");
    h.receive(invite.clone());
    h.send(build_response(&invite, 180));
    h.advance(Duration::from_millis(300));
    assert_eq!(codes(&h.transport.sent()), vec![100, 180]);
}

#[test]
fn success_response_moves_to_stale_and_acks_go_to_the_tu() {
    let mut h = Harness::new();
    let invite = build_invite("z9hG4bKist5");
    let key = server_key("z9hG4bKist5");

    h.receive(invite.clone());
    let ok = build_response(&invite, 200);
    h.send(ok.clone());
    assert_eq!(
        h.engine.server_record(&key.id).map(|r| r.machine()),
        Some(Machine::ServerStale)
    );

    // Retransmitted INVITE is absorbed; the TU resends its 2xx itself.
    h.receive(invite.clone());
    h.send(ok);
    assert_eq!(codes(&h.transport.sent()), vec![100, 200, 200]);

    h.receive(build_request(Method::Ack, "z9hG4bKist5"));
    h.receive(build_request(Method::Ack, "z9hG4bKack5"));
    assert_eq!(received(&h), vec![Method::Invite, Method::Ack, Method::Ack]);

    h.advance(Duration::from_secs(32));
    assert!(h.engine.server_record(&key.id).is_none());
}

#[test]
fn abandoned_invite_turns_its_provisional_into_500() {
    let mut h = Harness::new();
    let invite = build_invite("z9hG4bKist6");
    let key = server_key("z9hG4bKist6");

    h.receive(invite.clone());
    let ringing = build_response(&invite, 180);
    h.send(ringing.clone());
    abandon(&mut h, "z9hG4bKist6");

    let sent = h.transport.sent();
    assert_eq!(codes(&sent), vec![100, 180, 500]);
    let error = sent[2].message.as_response().expect("response");
    assert_eq!(error.reason(), "Server Error");
    assert_eq!(error.headers().to_tag(), ringing.headers().to_tag());
    assert_eq!(
        h.engine.server_record(&key.id).map(|r| r.state()),
        Some(State::Completed)
    );
}

// ===========================
// CANCEL
// ===========================

#[test]
fn cancel_joins_its_invite() {
    let mut h = Harness::new();
    let invite = build_invite("z9hG4bKscan1");
    let cancel = build_cancel(&invite);
    let key = server_key("z9hG4bKscan1");

    h.receive(invite.clone());
    h.receive(cancel.clone());
    assert_eq!(received(&h), vec![Method::Invite, Method::Cancel]);

    let cancel_record = h
        .engine
        .server_record(&key.id.cancel_id())
        .expect("cancel record");
    assert_eq!(cancel_record.owner(), sip_testkit::TU);

    h.send(build_response(&cancel, 200));
    h.send(build_response(&invite, 487));
    assert_eq!(codes(&h.transport.sent()), vec![100, 200, 487]);
}

#[test]
fn rfc2543_cancel_joins_its_invite() {
    let mut h = Harness::new();
    let invite = build_invite("oldstyle1");
    let cancel = build_cancel(&invite);
    let invite_id = TransactionId::for_message(&invite.clone().into()).expect("id");

    h.receive(invite.clone());
    h.receive(cancel.clone());
    assert_eq!(received(&h), vec![Method::Invite, Method::Cancel]);
    assert!(h.engine.server_record(&invite_id.cancel_id()).is_some());

    h.send(build_response(&cancel, 200));
    h.send(build_response(&invite, 487));
    assert_eq!(codes(&h.transport.sent()), vec![100, 200, 487]);
}

#[test]
fn cancel_without_invite_gets_481() {
    let mut h = Harness::new();
    h.receive(build_cancel(&build_invite("z9hG4bKscan2")));

    assert_eq!(codes(&h.transport.sent()), vec![481]);
    assert!(h.tu.deliveries().is_empty());
    assert_eq!(h.engine.server_transactions().len(), 0);
}

#[test]
fn unsent_stateless_reply_is_attempted_once() {
    let mut h = Harness::new();
    h.transport.set_accepting(false);
    h.receive(build_cancel(&build_invite("z9hG4bKscan3")));

    assert_eq!(codes(&h.transport.sent()), vec![481]);
    assert_eq!(h.engine.server_transactions().len(), 0);
    assert_eq!(h.engine.pending_timers(), 0);
}

// ===========================
// Rejections
// ===========================

#[test]
fn colliding_transaction_id_gets_400() {
    let mut h = Harness::new();
    h.receive(build_options("z9hG4bKrej1"));
    h.receive(build_request(Method::Register, "z9hG4bKrej1"));

    let sent = h.transport.sent();
    assert_eq!(codes(&sent), vec![400]);
    let response = sent[0].message.as_response().expect("response");
    assert_eq!(response.reason(), "Transaction Identifier Collision");
    assert_eq!(received(&h), vec![Method::Options]);
}

#[test]
fn request_without_owner_gets_500() {
    let mut h = Harness::new();
    h.tu.set_owner(None);
    h.receive(build_options("z9hG4bKrej2"));

    assert_eq!(codes(&h.transport.sent()), vec![500]);
    assert_eq!(h.engine.server_transactions().len(), 0);
}

#[test]
fn malformed_request_gets_400_with_the_parse_error() {
    let mut h = Harness::new();
    let error = ParseError {
        kind: ParseErrorKind::MissingHeader {
            name: "Call-ID".into(),
        },
        partial: Some(build_options("z9hG4bKrej3")),
    };
    h.engine.handle(Event::Wire(WireMessage {
        parsed: Err(error),
        source: peer(Transport::Udp),
    }));

    let sent = h.transport.sent();
    assert_eq!(codes(&sent), vec![400]);
    assert_eq!(
        sent[0].message.as_response().map(|r| r.reason().to_string()),
        Some("Missing Call-ID header".to_string())
    );

    // Nothing recoverable: dropped.
    h.engine.handle(Event::Wire(WireMessage {
        parsed: Err(ParseError {
            kind: ParseErrorKind::InvalidStartLine,
            partial: None,
        }),
        source: peer(Transport::Udp),
    }));
    assert_eq!(h.transport.sent().len(), 1);
}

#[test]
fn congested_tu_rejects_new_requests_with_retry_after() {
    let mut h = Harness::new();
    h.tu.set_behavior(RejectionBehavior::RejectingNewWork);
    h.tu.set_expected_wait(30);

    h.receive(build_options("z9hG4bKcong2"));

    let sent = h.transport.sent();
    assert_eq!(codes(&sent), vec![503]);
    let response = sent[0].message.as_response().expect("response");
    assert_eq!(response.headers().retry_after(), Some(30));
    assert!(h.tu.deliveries().is_empty());
    assert_eq!(h.engine.metrics().snapshot().congestion_rejections, 1);

    // ACKs still get through unless the TU sheds non-essential work.
    h.receive(build_request(Method::Ack, "z9hG4bKcong3"));
    assert_eq!(received(&h), vec![Method::Ack]);
    h.tu.set_behavior(RejectionBehavior::RejectingNonEssential);
    h.receive(build_request(Method::Ack, "z9hG4bKcong4"));
    assert_eq!(received(&h), vec![Method::Ack]);
}

#[test]
fn termination_notices_are_opt_in() {
    let mut h = Harness::new();
    h.tu.set_wants_notices(false);
    let request = build_request_over(Method::Options, "z9hG4bKopt1", "TCP");

    h.receive_from(request.clone(), peer(Transport::Tcp));
    h.send(build_response(&request, 200));

    assert!(h.engine.server_transactions().is_empty());
    assert!(h.tu.terminations().is_empty());
}
