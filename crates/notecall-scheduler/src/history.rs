//! Reminder history: what fired recently and how it ended.
//! In-memory ring buffer; the durable copy lives in the repository's reminder log.

use std::collections::VecDeque;

use notecall_core::ReminderRecord;

const DEFAULT_CAPACITY: usize = 100;

/// Most recent reminder records, oldest first.
pub struct OutcomeHistory {
    records: VecDeque<ReminderRecord>,
    capacity: usize,
}

impl OutcomeHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Record a fired reminder, evicting the oldest when full.
    pub fn record(&mut self, record: ReminderRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ReminderRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for OutcomeHistory {
    fn default() -> Self {
        Self::new()
    }
}
