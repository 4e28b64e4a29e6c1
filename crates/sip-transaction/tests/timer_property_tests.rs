// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::{Duration, Instant};

use proptest::prelude::*;
use sip_transaction::{TimerConfig, TimerKind, TimerRegistry, TransactionId, TransactionKey};

fn key(n: usize) -> TransactionKey {
    TransactionKey::client(TransactionId::new(format!("z9hg4bk{}", n)))
}

proptest! {
    /// Timers pop in due order; timers due together pop in the order they
    /// were scheduled.
    #[test]
    fn pops_by_due_then_insertion(delays in prop::collection::vec(0u64..20, 1..64)) {
        let start = Instant::now();
        let mut registry = TimerRegistry::new();
        for (n, delay) in delays.iter().enumerate() {
            registry.schedule(TimerKind::K, key(n), n as u64, Duration::from_millis(*delay), start);
        }

        let popped = registry.pop_all_due(start + Duration::from_millis(20));
        prop_assert_eq!(popped.len(), delays.len());
        prop_assert!(registry.is_empty());

        let order: Vec<(u64, u64)> = popped
            .iter()
            .map(|t| (t.delay.as_millis() as u64, t.serial))
            .collect();
        let mut expected = order.clone();
        expected.sort();
        prop_assert_eq!(order, expected);
    }

    /// Nothing pops early, and the registry reports how long to wait.
    #[test]
    fn nothing_pops_before_due(delays in prop::collection::vec(1u64..10_000, 1..32), probe in 0u64..10_000) {
        let start = Instant::now();
        let mut registry = TimerRegistry::new();
        for (n, delay) in delays.iter().enumerate() {
            registry.schedule(TimerKind::F, key(n), 1, Duration::from_millis(*delay), start);
        }

        let min = *delays.iter().min().expect("non-empty");
        let now = start + Duration::from_millis(probe);
        prop_assert_eq!(
            registry.time_until_next(now),
            Some(Duration::from_millis(min.saturating_sub(probe)))
        );

        let popped = registry.pop_all_due(now);
        prop_assert!(popped.iter().all(|t| t.delay <= Duration::from_millis(probe)));
        prop_assert_eq!(popped.len(), delays.iter().filter(|&&d| d <= probe).count());
    }

    /// The delayed non-INVITE 100 goes out when the client's Timer E
    /// reaches T2.
    #[test]
    fn non_invite_trying_is_sum_of_backoff(t1 in 1u64..2_000, factor in 1u64..16) {
        let timers = TimerConfig {
            t1: Duration::from_millis(t1),
            t2: Duration::from_millis(t1 * factor),
            ..TimerConfig::default()
        };
        let mut interval = t1;
        let mut total = 0;
        while interval < t1 * factor {
            total += interval;
            interval *= 2;
        }
        prop_assert_eq!(timers.non_invite_trying(), Duration::from_millis(total));
    }
}
