// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timer registry for the transaction state machines (RFC 3261 §17).
//!
//! Timers live in a binary heap keyed on `(due, seq)`: `seq` is a
//! monotonically increasing insertion counter, so timers that come due at the
//! same instant pop in the order they were scheduled. That ordering matters
//! when two timers of one transaction fire in the same tick.
//!
//! Timers are never cancelled. A timer that outlives its transaction pops as
//! usual and the engine drops it when no matching record is found.
//!
//! # Usage
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use sip_transaction::{TimerKind, TimerRegistry, TransactionId, TransactionKey};
//!
//! let key = TransactionKey::client(TransactionId::new("z9hg4bk1"));
//! let mut registry = TimerRegistry::new();
//! let start = Instant::now();
//!
//! registry.schedule(TimerKind::E1, key.clone(), 1, Duration::from_millis(500), start);
//! registry.schedule(TimerKind::F, key, 1, Duration::from_secs(32), start);
//!
//! assert_eq!(registry.time_until_next(start), Some(Duration::from_millis(500)));
//! let due = registry.pop_all_due(start + Duration::from_millis(500));
//! assert_eq!(due.len(), 1);
//! assert_eq!(due[0].kind, TimerKind::E1);
//! ```

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use crate::TransactionKey;

/// Timers used by the transaction machines.
///
/// Timer E is split in two: `E1` is the doubling retransmit of the Trying
/// state and `E2` the fixed-T2 retransmit of the Proceeding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    A,
    B,
    D,
    E1,
    E2,
    F,
    G,
    H,
    I,
    J,
    K,
    /// Delayed 100 Trying from a server transaction.
    Trying,
    StaleClient,
    StaleServer,
    Stateless,
    /// Gives a client INVITE up after it has sent a CANCEL.
    CleanUp,
}

impl TimerKind {
    /// True for the timers that retransmit a buffered message.
    pub fn is_retransmit(self) -> bool {
        matches!(self, TimerKind::A | TimerKind::E1 | TimerKind::E2 | TimerKind::G)
    }
}

/// A scheduled (or popped) timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub kind: TimerKind,
    pub key: TransactionKey,
    /// Serial of the record that armed the timer.
    pub serial: u64,
    /// The delay this timer was armed with; doubling timers grow from it.
    pub delay: Duration,
}

/// Identifies a scheduled timer by its insertion sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Entry {
    due: Instant,
    seq: u64,
    timer: Timer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Priority queue of pending transaction timers.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a timer due at `now + delay`.
    ///
    /// Timers are not deduplicated: a transaction can hold several timers of
    /// the same kind.
    pub fn schedule(
        &mut self,
        kind: TimerKind,
        key: TransactionKey,
        serial: u64,
        delay: Duration,
        now: Instant,
    ) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            due: now + delay,
            seq,
            timer: Timer {
                kind,
                key,
                serial,
                delay,
            },
        }));
        TimerHandle(seq)
    }

    /// Time until the earliest timer is due.
    ///
    /// `Some(Duration::ZERO)` when a timer is already due, `None` when the
    /// registry is empty.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.due.saturating_duration_since(now))
    }

    /// Removes every timer due at or before `now`, earliest first, ties in
    /// insertion order.
    pub fn pop_all_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.due > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.timer);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Source of the current time for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that follows tokio's time source, so paused test runtimes apply.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionId;

    fn key(id: &str) -> TransactionKey {
        TransactionKey::client(TransactionId::new(id))
    }

    #[test]
    fn empty_registry_has_no_next() {
        let registry = TimerRegistry::new();
        assert_eq!(registry.time_until_next(Instant::now()), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn overdue_timer_reports_zero() {
        let mut registry = TimerRegistry::new();
        let start = Instant::now();
        registry.schedule(TimerKind::K, key("a"), 1, Duration::from_secs(5), start);
        assert_eq!(
            registry.time_until_next(start + Duration::from_secs(9)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn pops_in_due_order() {
        let mut registry = TimerRegistry::new();
        let start = Instant::now();
        registry.schedule(TimerKind::F, key("a"), 1, Duration::from_secs(32), start);
        registry.schedule(TimerKind::E1, key("a"), 1, Duration::from_millis(500), start);
        registry.schedule(TimerKind::K, key("b"), 2, Duration::from_secs(5), start);

        let due = registry.pop_all_due(start + Duration::from_secs(6));
        let kinds: Vec<_> = due.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TimerKind::E1, TimerKind::K]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn equal_due_times_pop_fifo() {
        let mut registry = TimerRegistry::new();
        let start = Instant::now();
        let delay = Duration::from_millis(3500);
        registry.schedule(TimerKind::Trying, key("a"), 1, delay, start);
        registry.schedule(TimerKind::J, key("a"), 1, delay, start);
        registry.schedule(TimerKind::E1, key("a"), 1, delay, start);

        let kinds: Vec<_> = registry
            .pop_all_due(start + delay)
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(kinds, vec![TimerKind::Trying, TimerKind::J, TimerKind::E1]);
    }

    #[test]
    fn popped_timer_keeps_its_delay() {
        let mut registry = TimerRegistry::new();
        let start = Instant::now();
        registry.schedule(TimerKind::A, key("a"), 7, Duration::from_secs(2), start);
        let due = registry.pop_all_due(start + Duration::from_secs(2));
        assert_eq!(due[0].delay, Duration::from_secs(2));
        assert_eq!(due[0].serial, 7);
    }

    #[test]
    fn retransmit_kinds() {
        assert!(TimerKind::A.is_retransmit());
        assert!(TimerKind::E2.is_retransmit());
        assert!(!TimerKind::B.is_retransmit());
        assert!(!TimerKind::Trying.is_retransmit());
    }
}
