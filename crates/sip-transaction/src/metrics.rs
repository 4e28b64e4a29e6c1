// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction layer metrics.
//!
//! The [`Engine`](crate::Engine) records into a [`TransactionMetrics`] as it
//! runs:
//! - **Creations** per state machine
//! - **Terminations** per [`TransactionOutcome`], with durations per method
//! - **Timer fires** per [`TimerKind`]
//! - **Retransmissions**, congestion rejections and absorbed messages
//!
//! `TransactionMetrics` is `Clone` and shares its storage, so a handle taken
//! with [`Engine::metrics`](crate::Engine::metrics) before the engine moves
//! into its driver keeps observing it.
//!
//! ```
//! use std::time::Duration;
//! use sip_transaction::{Machine, TimerKind, TransactionMetrics, TransactionOutcome};
//!
//! let metrics = TransactionMetrics::new();
//! metrics.record_created(Machine::ClientInvite);
//! metrics.record_timer_fired(TimerKind::A);
//! metrics.record_terminated("INVITE", TransactionOutcome::Timeout, Duration::from_secs(32));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.created.get(&Machine::ClientInvite), Some(&1));
//! assert_eq!(snapshot.outcomes.get(&TransactionOutcome::Timeout), Some(&1));
//! ```
//!
//! All operations take a `parking_lot::RwLock`; recording is a write lock,
//! snapshots a read lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::record::Machine;
use crate::timers::TimerKind;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    /// Ran its machine to the end
    Completed,
    /// Timer B, F or CleanUp expired without a final response
    Timeout,
    /// A transport failure ended it without failover
    TransportError,
    /// Every DNS target failed or resolution timed out
    DnsExhausted,
    /// The TU abandoned a server transaction
    Abandoned,
    /// Timer H expired: the peer never acknowledged a failure response
    NoAck,
}

/// Duration statistics for one method.
#[derive(Debug, Clone, Default)]
pub struct DurationStats {
    pub count: u64,
    pub total_duration: Duration,
    pub avg_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
}

/// Plain-data copy of the counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Records created, by machine
    pub created: HashMap<Machine, u64>,
    /// Terminations, by outcome
    pub outcomes: HashMap<TransactionOutcome, u64>,
    /// Lifetimes of terminated transactions, by method
    pub by_method: HashMap<String, DurationStats>,
    pub timer_fires: HashMap<TimerKind, u64>,
    pub retransmissions: u64,
    /// New requests answered 503 because their TU is congested
    pub congestion_rejections: u64,
    /// Messages logged and dropped: strays, collisions, late traffic
    pub absorbed: u64,
    pub total_terminated: u64,
    pub timestamp: Instant,
}

impl MetricsSnapshot {
    pub fn timer_fire_count(&self, kind: TimerKind) -> u64 {
        self.timer_fires.get(&kind).copied().unwrap_or(0)
    }

    pub fn outcome_count(&self, outcome: TransactionOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct MetricsData {
    created: HashMap<Machine, u64>,
    outcomes: HashMap<TransactionOutcome, u64>,
    durations_by_method: HashMap<String, Vec<Duration>>,
    timer_fires: HashMap<TimerKind, u64>,
    retransmissions: u64,
    congestion_rejections: u64,
    absorbed: u64,
    total_terminated: u64,
}

/// Thread-safe transaction metrics collector.
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    data: Arc<RwLock<MetricsData>>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(MetricsData::default())),
        }
    }

    pub fn record_created(&self, machine: Machine) {
        let mut data = self.data.write();
        *data.created.entry(machine).or_insert(0) += 1;
    }

    /// Records a termination and how long the transaction lived.
    pub fn record_terminated(&self, method: &str, outcome: TransactionOutcome, lifetime: Duration) {
        let mut data = self.data.write();
        *data.outcomes.entry(outcome).or_insert(0) += 1;
        data.durations_by_method
            .entry(method.to_string())
            .or_insert_with(Vec::new)
            .push(lifetime);
        data.total_terminated += 1;
    }

    pub fn record_timer_fired(&self, kind: TimerKind) {
        let mut data = self.data.write();
        *data.timer_fires.entry(kind).or_insert(0) += 1;
    }

    pub fn record_retransmission(&self) {
        self.data.write().retransmissions += 1;
    }

    pub fn record_congestion_rejection(&self) {
        self.data.write().congestion_rejections += 1;
    }

    pub fn record_absorbed(&self) {
        self.data.write().absorbed += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let data = self.data.read();

        let by_method = data
            .durations_by_method
            .iter()
            .map(|(method, durations)| (method.clone(), calculate_stats(durations)))
            .collect();

        MetricsSnapshot {
            created: data.created.clone(),
            outcomes: data.outcomes.clone(),
            by_method,
            timer_fires: data.timer_fires.clone(),
            retransmissions: data.retransmissions,
            congestion_rejections: data.congestion_rejections,
            absorbed: data.absorbed,
            total_terminated: data.total_terminated,
            timestamp: Instant::now(),
        }
    }

    /// Resets all collected metrics.
    pub fn reset(&self) {
        *self.data.write() = MetricsData::default();
    }
}

impl Default for TransactionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn calculate_stats(durations: &[Duration]) -> DurationStats {
    if durations.is_empty() {
        return DurationStats::default();
    }

    let total_duration: Duration = durations.iter().sum();
    DurationStats {
        count: durations.len() as u64,
        total_duration,
        avg_duration: total_duration / durations.len() as u32,
        min_duration: durations.iter().min().copied(),
        max_duration: durations.iter().max().copied(),
    }
}
