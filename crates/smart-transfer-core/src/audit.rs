// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Verification audit log
//
// Fixed-capacity ring buffer of verification attempts. When full, the
// oldest entry is dropped to make room.

use crate::types::VerificationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of entries retained
pub const DEFAULT_LOG_RETENTION: usize = 50;

/// Immutable snapshot of one verification attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationLogEntry {
    pub file_id: String,
    pub name: String,
    pub verification_state: VerificationState,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, append-only history of verification attempts
#[derive(Debug, Clone)]
pub struct VerificationLog {
    entries: VecDeque<VerificationLogEntry>,
    capacity: usize,
    total_appended: u64,
}

impl VerificationLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total_appended: 0,
        }
    }

    /// Append an entry, returning the evicted oldest entry if the log was full
    pub fn push(&mut self, entry: VerificationLogEntry) -> Option<VerificationLogEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        self.total_appended += 1;
        evicted
    }

    /// Up to `limit` entries, most recent first
    pub fn recent(&self, limit: usize) -> Vec<VerificationLogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries ever appended, including evicted ones
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}

impl Default for VerificationLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RETENTION)
    }
}
