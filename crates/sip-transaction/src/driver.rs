// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tokio task that owns an [`Engine`] and feeds it.
//!
//! Producers (transports, TUs, DNS callbacks) hold cloned [`EngineHandle`]s
//! and never block; the [`Driver`] is the only consumer. It sleeps until
//! either an event arrives or the next timer is due.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    engine::Engine,
    event::{AppMessage, Event, WireMessage},
    transport::TransportFailure,
    TransactionId, TransactionKey,
};

/// Cloneable sender of [`Event`]s into a running [`Driver`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EngineHandle {
    /// Enqueues an event. Fails only once the driver has stopped.
    pub fn submit(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("transaction engine is no longer running"))
    }

    pub fn receive(&self, message: WireMessage) -> Result<()> {
        self.submit(Event::Wire(message))
    }

    pub fn send(&self, message: AppMessage) -> Result<()> {
        self.submit(Event::Application(message))
    }

    pub fn cancel_client_invite(&self, id: TransactionId) -> Result<()> {
        self.submit(Event::CancelClientInvite { id })
    }

    pub fn abandon_server(&self, id: TransactionId) -> Result<()> {
        self.submit(Event::AbandonServer { id })
    }

    pub fn dns_completed(&self, key: TransactionKey) -> Result<()> {
        self.submit(Event::DnsCompleted { key })
    }

    pub fn transport_failure(&self, key: TransactionKey, failure: TransportFailure) -> Result<()> {
        self.submit(Event::TransportFailure { key, failure })
    }

    /// True once the driver is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Event loop around an [`Engine`].
///
/// The engine's clock must follow tokio time (the default
/// [`SystemClock`](crate::SystemClock) does in a real runtime; use
/// [`TokioClock`](crate::TokioClock) under a paused test runtime).
pub struct Driver {
    engine: Engine,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Driver {
    pub fn new(engine: Engine) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { engine, rx }, EngineHandle { tx })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs until every [`EngineHandle`] is dropped, then hands the engine
    /// back. Timers still pending at that point are not fired.
    pub async fn run(mut self) -> Engine {
        loop {
            let fired = self.engine.process_due_timers();
            if fired > 0 {
                trace!(fired, "timers processed");
            }

            let event = match self.engine.time_until_next_timer() {
                Some(wait) => {
                    tokio::select! {
                        event = self.rx.recv() => event,
                        _ = tokio::time::sleep(wait) => continue,
                    }
                }
                None => self.rx.recv().await,
            };

            match event {
                Some(event) => self.engine.handle(event),
                None => {
                    debug!(
                        pending_timers = self.engine.pending_timers(),
                        "all engine handles dropped; driver stopping"
                    );
                    return self.engine;
                }
            }
        }
    }
}
