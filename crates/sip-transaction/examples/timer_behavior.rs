// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer behaviour of client transactions.
//!
//! Runs the same OPTIONS over UDP and over TCP against a peer that never
//! answers, then prints when each copy went out and what the metrics saw.
//!
//! ```bash
//! cargo run -p sip-transaction --example timer_behavior
//! ```

use std::time::Duration;

use sip_testkit::{build_invite, build_options, client_key, tcp_target, udp_target, Harness};
use sip_transaction::{TimerKind, TransactionOutcome};

fn main() {
    println!("=== Non-INVITE over UDP ===");
    run_options(udp_target(5060), "z9hG4bKudp");

    println!("\n=== Non-INVITE over TCP ===");
    run_options(tcp_target(5060), "z9hG4bKtcp");

    println!("\n=== INVITE over UDP ===");
    let mut h = Harness::new();
    h.transport.push_resolution([udp_target(5060)]);
    h.send(build_invite("z9hG4bKinv"));
    h.advance(Duration::from_secs(40));
    print_sent(&h, "z9hG4bKinv");
    print_metrics(&h);
}

fn run_options(target: sip_transaction::Target, branch: &str) {
    let mut h = Harness::new();
    h.transport.push_resolution([target]);
    h.send(build_options(branch));
    h.advance(Duration::from_secs(40));
    print_sent(&h, branch);
    print_metrics(&h);
}

fn print_sent(h: &Harness, branch: &str) {
    for sent in h.transport.sent_for(&client_key(branch)) {
        println!(
            "  t={:>6}ms  {} -> {}{}",
            sent.at.as_millis(),
            sent.message.brief(),
            sent.target,
            if sent.retransmission { "  (retransmission)" } else { "" }
        );
    }
    println!("  TU saw: {:?}", h.tu.response_codes());
}

fn print_metrics(h: &Harness) {
    let snapshot = h.engine.metrics().snapshot();
    println!(
        "  retransmissions={} E1={} A={} timeouts={}",
        snapshot.retransmissions,
        snapshot.timer_fire_count(TimerKind::E1),
        snapshot.timer_fire_count(TimerKind::A),
        snapshot.outcome_count(TransactionOutcome::Timeout),
    );
}
