// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timer constants and engine options.
//!
//! Values are fixed for the life of an engine. They can be loaded from a JSON
//! document whose fields are all optional milliseconds:
//!
//! ```
//! use std::time::Duration;
//! use sip_transaction::TransactionConfig;
//!
//! let config = TransactionConfig::from_json_str(r#"{ "t1_ms": 250, "t100_ms": 80 }"#).unwrap();
//! assert_eq!(config.timers.t1, Duration::from_millis(250));
//! assert_eq!(config.timers.transaction_timeout(), Duration::from_secs(16));
//! assert!(config.discard_stray_responses);
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use smol_str::SmolStr;

/// RFC 3261 base timer values (Table 4) plus the stack's linger timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTT estimate - default 500ms
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE - default 4s
    pub t2: Duration,
    /// Maximum duration a message remains in the network - default 5s
    pub t4: Duration,
    /// Delay before a server INVITE sends 100 Trying; zero sends it at once
    pub t100: Duration,
    /// Linger of stale and stateless records - default 32s
    pub ts: Duration,
    /// Timer D, absorbing failure retransmissions - default 32s
    pub td: Duration,
    /// How long a target that timed out stays greylisted - default 32s
    pub greylist: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t100: Duration::ZERO,
            ts: Duration::from_secs(32),
            td: Duration::from_secs(32),
            greylist: Duration::from_secs(32),
        }
    }
}

impl TimerConfig {
    /// `64*T1`: timers B, F, H and J.
    pub fn transaction_timeout(&self) -> Duration {
        self.t1.saturating_mul(64)
    }

    /// `128*T1`, the grace given to a client INVITE after it sent a CANCEL.
    pub fn cleanup(&self) -> Duration {
        self.t1.saturating_mul(128)
    }

    /// Delay before a server non-INVITE sends 100 Trying (RFC 4320).
    ///
    /// This is the time the client's Timer E needs to back off to T2, so
    /// the 100 arrives before the client's retransmissions go flat: 3.5s
    /// for the default T1/T2.
    pub fn non_invite_trying(&self) -> Duration {
        let mut interval = self.t1;
        let mut total = Duration::ZERO;
        while interval < self.t2 && !interval.is_zero() {
            total += interval;
            interval = interval.saturating_mul(2);
        }
        total
    }

}

/// Options for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    pub timers: TimerConfig,
    /// Drop responses that match no client transaction instead of handing
    /// them to the default TU.
    pub discard_stray_responses: bool,
    /// Host written into synthesized `Warning` headers.
    pub agent: SmolStr,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timers: TimerConfig::default(),
            discard_stray_responses: true,
            agent: SmolStr::new("siphon"),
        }
    }
}

/// On-disk shape of [`TransactionConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTransactionConfig {
    t1_ms: Option<u64>,
    t2_ms: Option<u64>,
    t4_ms: Option<u64>,
    t100_ms: Option<u64>,
    ts_ms: Option<u64>,
    td_ms: Option<u64>,
    greylist_ms: Option<u64>,
    discard_stray_responses: Option<bool>,
    agent: Option<String>,
}

impl TransactionConfig {
    /// Parses a JSON config, filling unset fields with defaults.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: FileTransactionConfig =
            serde_json::from_str(contents).context("invalid transaction config")?;
        Self::from_file_config(raw)
    }

    fn from_file_config(raw: FileTransactionConfig) -> Result<Self> {
        let defaults = TransactionConfig::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let d = defaults.timers;
        let timers = TimerConfig {
            t1: ms(raw.t1_ms, d.t1),
            t2: ms(raw.t2_ms, d.t2),
            t4: ms(raw.t4_ms, d.t4),
            t100: ms(raw.t100_ms, d.t100),
            ts: ms(raw.ts_ms, d.ts),
            td: ms(raw.td_ms, d.td),
            greylist: ms(raw.greylist_ms, d.greylist),
        };
        if timers.t1.is_zero() {
            bail!("t1 must be greater than zero");
        }
        if timers.t2 < timers.t1 {
            bail!(
                "t2 ({:?}) must not be shorter than t1 ({:?})",
                timers.t2,
                timers.t1
            );
        }

        Ok(Self {
            timers,
            discard_stray_responses: raw
                .discard_stray_responses
                .unwrap_or(defaults.discard_stray_responses),
            agent: raw.agent.map(SmolStr::new).unwrap_or(defaults.agent),
        })
    }
}
