//! Per-level change statistics.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::TimestampMs;

/// How many recent changes a level remembers
pub const RECENT_CHANGES_CAPACITY: usize = 128;

/// One recorded amount change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Engine time of the change
    pub ts_ms: TimestampMs,
    /// Signed amount change; positive means the level grew
    pub delta: f64,
}

/// Counters and a bounded history of amount changes at one price level.
///
/// Survives snapshot rebuilds: when a snapshot replaces the book, levels that
/// exist on both sides of the rebuild keep their stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeStats {
    increase_count: u64,
    decrease_count: u64,
    recent_changes: VecDeque<Change>,
}

impl ChangeStats {
    /// Create empty stats
    #[must_use]
    pub fn new() -> Self {
        Self {
            increase_count: 0,
            decrease_count: 0,
            recent_changes: VecDeque::with_capacity(RECENT_CHANGES_CAPACITY),
        }
    }

    /// Record a change. Zero deltas are ignored.
    pub fn record(&mut self, delta: f64, ts_ms: TimestampMs) {
        if delta > 0.0 {
            self.increase_count += 1;
        } else if delta < 0.0 {
            self.decrease_count += 1;
        } else {
            return;
        }
        self.push(Change { ts_ms, delta });
    }

    /// Record the amount a level was created with. Kept in the history but
    /// not counted as an increase.
    pub fn record_initial(&mut self, amount: f64, ts_ms: TimestampMs) {
        self.push(Change {
            ts_ms,
            delta: amount,
        });
    }

    fn push(&mut self, change: Change) {
        if self.recent_changes.len() == RECENT_CHANGES_CAPACITY {
            self.recent_changes.pop_front();
        }
        self.recent_changes.push_back(change);
    }

    /// Times the amount grew
    #[must_use]
    pub fn increase_count(&self) -> u64 {
        self.increase_count
    }

    /// Times the amount shrank
    #[must_use]
    pub fn decrease_count(&self) -> u64 {
        self.decrease_count
    }

    /// Recent changes, oldest first
    pub fn recent_changes(&self) -> impl DoubleEndedIterator<Item = &Change> + ExactSizeIterator {
        self.recent_changes.iter()
    }

    /// The `index`-th retained change, oldest first
    #[must_use]
    pub fn change(&self, index: usize) -> Option<Change> {
        self.recent_changes.get(index).copied()
    }

    /// Most recent change
    #[must_use]
    pub fn last_change(&self) -> Option<Change> {
        self.recent_changes.back().copied()
    }

    /// Number of retained changes
    #[must_use]
    pub fn recent_len(&self) -> usize {
        self.recent_changes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts() {
        let mut stats = ChangeStats::new();
        stats.record(1.5, 10);
        stats.record(-0.5, 11);
        stats.record(0.0, 12);

        assert_eq!(stats.increase_count(), 1);
        assert_eq!(stats.decrease_count(), 1);
        assert_eq!(stats.recent_len(), 2);
        assert_eq!(stats.change(1), Some(Change { ts_ms: 11, delta: -0.5 }));
    }

    #[test]
    fn test_initial_amount_not_counted() {
        let mut stats = ChangeStats::new();
        stats.record_initial(0.255, 1);
        stats.record(0.045, 2);

        assert_eq!(stats.increase_count(), 1);
        assert_eq!(stats.recent_len(), 2);
        assert_eq!(stats.change(0).map(|c| c.delta), Some(0.255));
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut stats = ChangeStats::new();
        for i in 0..(RECENT_CHANGES_CAPACITY as i64 + 5) {
            stats.record(1.0, i);
        }

        assert_eq!(stats.recent_len(), RECENT_CHANGES_CAPACITY);
        assert_eq!(stats.change(0).map(|c| c.ts_ms), Some(5));
        assert_eq!(
            stats.last_change().map(|c| c.ts_ms),
            Some(RECENT_CHANGES_CAPACITY as i64 + 4)
        );
        assert_eq!(stats.increase_count(), RECENT_CHANGES_CAPACITY as u64 + 5);
    }
}
