//! Bounded history buffer.
//!
//! On overflow the oldest non-CRITICAL entry goes first; only a buffer full of
//! CRITICAL entries gives up its oldest CRITICAL one (the durable copy stays).

use super::HistoryEntry;
use std::collections::VecDeque;

#[derive(Debug)]
pub(super) struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    evictions: u64,
}

impl HistoryRing {
    pub(super) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            evictions: 0,
        }
    }

    /// Append, returning the evicted entry if the buffer was full
    pub(super) fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.evictions += 1;
            match self.entries.iter().position(|e| !e.is_critical()) {
                Some(idx) => self.entries.remove(idx),
                None => self.entries.pop_front(),
            }
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub(super) fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub(super) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn evictions(&self) -> u64 {
        self.evictions
    }
}
