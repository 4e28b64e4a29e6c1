// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use sip_core::{Request, SipMessage};

use crate::TransactionKey;

/// Opaque handle of a transaction user (the layer above transactions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TuId(pub u32);

impl TuId {
    /// Owner of messages that belong to no particular TU: stray responses and
    /// ACKs that arrive outside any transaction.
    pub const DEFAULT: TuId = TuId(0);
}

/// How a congested TU wants new and continuing work treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionBehavior {
    #[default]
    Normal,
    /// Answer new requests with 503; keep delivering everything else.
    RejectingNewWork,
    /// As above, and also drop ACKs and optional responses.
    RejectingNonEssential,
}

/// Delivery side of the transaction layer.
///
/// Calls are made from the engine's consumer thread and must not block.
pub trait TuDispatcher: Send + Sync {
    /// Picks the owner of a new inbound request, or `None` to reject it.
    fn select_owner(&self, request: &Request) -> Option<TuId>;

    fn deliver(&self, owner: TuId, key: &TransactionKey, message: SipMessage);

    /// Called when a transaction terminates, for owners that asked for it.
    fn notify_terminated(&self, owner: TuId, key: &TransactionKey);

    fn wants_termination_notices(&self, _owner: TuId) -> bool {
        false
    }

    fn rejection_behavior(&self, _owner: TuId) -> RejectionBehavior {
        RejectionBehavior::Normal
    }

    /// Seconds a rejected peer should wait, sent as `Retry-After`.
    fn expected_wait_secs(&self, _owner: TuId) -> u32 {
        0
    }

    /// Whether the owner must see every response even when shedding load.
    fn responses_mandatory(&self, _owner: TuId) -> bool {
        true
    }
}
