// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{sync::Arc, time::Duration};

use sip_testkit::{
    build_options, build_response, client_key, udp_target, ManualClock, RecordingTransport,
    RecordingTu, TU,
};
use sip_transaction::{AppMessage, Driver, Engine, TokioClock, TransactionConfig, WireMessage};

fn engine() -> (Engine, Arc<RecordingTransport>, Arc<RecordingTu>) {
    sip_testkit::init_tracing();
    let transport = Arc::new(RecordingTransport::new(ManualClock::new()));
    let tu = Arc::new(RecordingTu::default());
    let engine = Engine::with_clock(
        TransactionConfig::default(),
        transport.clone(),
        tu.clone(),
        Arc::new(TokioClock),
    );
    (engine, transport, tu)
}

#[tokio::test(start_paused = true)]
async fn driver_fires_timers_between_events() {
    let (engine, transport, tu) = engine();
    transport.push_resolution([udp_target(5060)]);
    let (driver, handle) = Driver::new(engine);
    let task = tokio::spawn(driver.run());

    let request = build_options("z9hG4bKdrv1");
    handle
        .send(AppMessage::new(request.clone(), TU))
        .expect("driver running");
    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert_eq!(transport.sent().len(), 3);

    handle
        .receive(WireMessage::new(
            build_response(&request, 200),
            sip_testkit::peer(sip_transaction::Transport::Udp),
        ))
        .expect("driver running");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(tu.response_codes(), vec![200]);
    assert_eq!(transport.sent().len(), 3);

    drop(handle);
    let engine = task.await.expect("driver task");
    let key = client_key("z9hG4bKdrv1");
    assert!(engine.client_record(&key.id).is_some());
}

#[tokio::test(start_paused = true)]
async fn driver_terminates_records_on_schedule() {
    let (engine, transport, tu) = engine();
    transport.push_resolution([udp_target(5060)]);
    let metrics = engine.metrics().clone();
    let (driver, handle) = Driver::new(engine);
    let task = tokio::spawn(driver.run());

    handle
        .send(AppMessage::new(build_options("z9hG4bKdrv2"), TU))
        .expect("driver running");
    tokio::time::sleep(Duration::from_secs(33)).await;

    assert_eq!(tu.response_codes(), vec![408]);
    assert_eq!(metrics.snapshot().total_terminated, 1);

    drop(handle);
    let engine = task.await.expect("driver task");
    assert!(engine.client_transactions().is_empty());
}

#[test]
fn submit_fails_once_the_driver_is_gone() {
    let (engine, _transport, _tu) = engine();
    let (driver, handle) = Driver::new(engine);
    assert!(!handle.is_closed());
    drop(driver);

    assert!(handle.is_closed());
    let err = handle
        .send(AppMessage::new(build_options("z9hG4bKdrv3"), TU))
        .unwrap_err();
    assert!(err.to_string().contains("no longer running"));
}
