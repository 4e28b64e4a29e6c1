// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;

use crate::{record::TransactionRecord, Side, TransactionId};

/// Records of one namespace, keyed by transaction id.
///
/// The engine owns one table per [`Side`] and is the only thing touching them.
#[derive(Debug)]
pub struct TransactionTable {
    side: Side,
    records: HashMap<TransactionId, TransactionRecord>,
}

impl TransactionTable {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            records: HashMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn find(&self, id: &TransactionId) -> Option<&TransactionRecord> {
        self.records.get(id)
    }

    /// Adds a record under its own id.
    ///
    /// # Panics
    ///
    /// If a record with that id is already present, or the record belongs to
    /// the other table. Callers look the id up first; reaching here with a
    /// live id is an engine defect.
    pub fn insert(&mut self, record: TransactionRecord) {
        assert_eq!(
            record.key().side,
            self.side,
            "{:?} record inserted into the {:?} table",
            record.key().side,
            self.side
        );
        let id = record.key().id.clone();
        if self.records.contains_key(&id) {
            panic!("transaction {} already live in the {:?} table", id, self.side);
        }
        self.records.insert(id, record);
    }

    pub fn erase(&mut self, id: &TransactionId) -> Option<TransactionRecord> {
        self.records.remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
