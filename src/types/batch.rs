//! Update batches ("slots").
//!
//! An [`UpdateBatch`] is one exchange push: a flat list of price levels with
//! the bids first and the asks after `bid_count`, plus the identifiers the
//! engine uses to chain batches together.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::{almost_equal, Amount, Price};

/// Default level capacity for freshly allocated batches
pub const DEFAULT_LEVEL_CAPACITY: usize = 10;

/// A single price level inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LevelEntry {
    /// Level price
    pub price: Price,
    /// New resting amount (zero removes the level)
    pub amount: Amount,
    /// Per-level version, for exchanges that version individual levels
    #[serde(default)]
    pub seq: i64,
}

impl LevelEntry {
    /// Create a level without a per-level version
    #[must_use]
    pub const fn new(price: Price, amount: Amount) -> Self {
        Self {
            price,
            amount,
            seq: 0,
        }
    }
}

/// One exchange push awaiting resequencing.
///
/// `arrival_index` is the resequencing key. It must be nonzero and should come
/// from an exchange-provided monotonic field whenever the exchange can deliver
/// out of order; receipt time is only safe for strictly ordered feeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateBatch {
    /// Resequencing key
    pub arrival_index: i64,
    /// Exchange event time
    pub exchange_ts_ms: i64,
    /// Local receipt time
    pub received_ts_ns: i64,
    /// Exchange sequence (diagnostic, some venues compare depth streams by it)
    pub seq: i64,
    /// First update id covered by this batch
    pub first_id: i64,
    /// Last update id covered by this batch
    pub last_id: i64,
    /// Last update id of the previous batch, as reported by the exchange
    pub prev_last_id: i64,
    /// Exchange's current id, where it differs from `last_id`
    pub cur_id: i64,
    /// Exchange checksum, kept verbatim
    pub checksum: String,
    /// Full replacement rather than delta
    pub is_snapshot: bool,
    /// Entries before this index are bids, the rest are asks
    pub bid_count: usize,
    /// Levels carry a per-level `seq`
    pub levels_with_seq: bool,
    /// Bids then asks
    pub levels: Vec<LevelEntry>,
}

impl UpdateBatch {
    /// Create an empty delta batch with the given resequencing key
    #[must_use]
    pub fn new(arrival_index: i64) -> Self {
        Self {
            arrival_index,
            levels: Vec::with_capacity(DEFAULT_LEVEL_CAPACITY),
            ..Self::default()
        }
    }

    /// Mark as snapshot
    #[must_use]
    pub fn snapshot(mut self) -> Self {
        self.is_snapshot = true;
        self
    }

    /// Set `last_id`
    #[must_use]
    pub fn with_last_id(mut self, last_id: i64) -> Self {
        self.last_id = last_id;
        self
    }

    /// Set `first_id`
    #[must_use]
    pub fn with_first_id(mut self, first_id: i64) -> Self {
        self.first_id = first_id;
        self
    }

    /// Set `prev_last_id`
    #[must_use]
    pub fn with_prev_last_id(mut self, prev_last_id: i64) -> Self {
        self.prev_last_id = prev_last_id;
        self
    }

    /// Set the exchange sequence
    #[must_use]
    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = seq;
        self
    }

    /// Append bid levels
    #[must_use]
    pub fn with_bids(mut self, bids: &[(Price, Amount)]) -> Self {
        for &(price, amount) in bids {
            self.push_bid(price, amount);
        }
        self
    }

    /// Append ask levels
    #[must_use]
    pub fn with_asks(mut self, asks: &[(Price, Amount)]) -> Self {
        for &(price, amount) in asks {
            self.push_ask(price, amount);
        }
        self
    }

    /// Insert a bid after the existing bids
    pub fn push_bid(&mut self, price: Price, amount: Amount) {
        self.levels
            .insert(self.bid_count, LevelEntry::new(price, amount));
        self.bid_count += 1;
    }

    /// Append an ask
    pub fn push_ask(&mut self, price: Price, amount: Amount) {
        self.levels.push(LevelEntry::new(price, amount));
    }

    /// Insert a versioned bid; marks the batch as carrying level seqs
    pub fn push_bid_with_seq(&mut self, price: Price, amount: Amount, seq: i64) {
        self.levels
            .insert(self.bid_count, LevelEntry { price, amount, seq });
        self.bid_count += 1;
        self.levels_with_seq = true;
    }

    /// Append a versioned ask; marks the batch as carrying level seqs
    pub fn push_ask_with_seq(&mut self, price: Price, amount: Amount, seq: i64) {
        self.levels.push(LevelEntry { price, amount, seq });
        self.levels_with_seq = true;
    }

    fn split(&self) -> usize {
        self.bid_count.min(self.levels.len())
    }

    /// Bid entries
    #[must_use]
    pub fn bids(&self) -> &[LevelEntry] {
        &self.levels[..self.split()]
    }

    /// Ask entries
    #[must_use]
    pub fn asks(&self) -> &[LevelEntry] {
        &self.levels[self.split()..]
    }

    /// Clear every field, keeping the level allocation
    pub fn reset(&mut self) {
        self.arrival_index = 0;
        self.exchange_ts_ms = 0;
        self.received_ts_ns = 0;
        self.seq = 0;
        self.first_id = 0;
        self.last_id = 0;
        self.prev_last_id = 0;
        self.cur_id = 0;
        self.checksum.clear();
        self.is_snapshot = false;
        self.bid_count = 0;
        self.levels_with_seq = false;
        self.levels.clear();
    }

    /// Content equality: identifiers exactly, levels under epsilon.
    ///
    /// `received_ts_ns` and `exchange_ts_ms` are receipt diagnostics and are
    /// not compared.
    #[must_use]
    pub fn content_eq(&self, other: &Self) -> bool {
        let ids = self.arrival_index == other.arrival_index
            && self.seq == other.seq
            && self.first_id == other.first_id
            && self.last_id == other.last_id
            && self.prev_last_id == other.prev_last_id
            && self.cur_id == other.cur_id
            && self.checksum == other.checksum
            && self.is_snapshot == other.is_snapshot
            && self.bid_count == other.bid_count
            && self.levels_with_seq == other.levels_with_seq;
        if !ids || self.levels.len() != other.levels.len() {
            return false;
        }
        self.levels.iter().zip(&other.levels).all(|(a, b)| {
            almost_equal(a.price, b.price)
                && almost_equal(a.amount, b.amount)
                && (!self.levels_with_seq || a.seq == b.seq)
        })
    }

    /// One-line rendering of the identifiers, without levels
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{{received_ts_ns={}, arrival_index={}, exchange_ts_ms={}, seq={}, first_id={}, \
             last_id={}, prev_last_id={}, cur_id={}, checksum={}, is_snapshot={}, bid_count={}}}",
            self.received_ts_ns,
            self.arrival_index,
            self.exchange_ts_ms,
            self.seq,
            self.first_id,
            self.last_id,
            self.prev_last_id,
            self.cur_id,
            self.checksum,
            self.is_snapshot,
            self.bid_count,
        )
    }
}

impl fmt::Display for UpdateBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut levels = String::new();
        for level in &self.levels {
            if self.levels_with_seq {
                let _ = write!(levels, "[{},{},{}],", level.price, level.amount, level.seq);
            } else {
                let _ = write!(levels, "[{},{}],", level.price, level.amount);
            }
        }
        write!(f, "UpdateBatch{} levels=[{}]", self.summary(), levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bids_before_asks() {
        let batch = UpdateBatch::new(1)
            .with_asks(&[(101.0, 1.0)])
            .with_bids(&[(100.0, 2.0), (99.0, 3.0)]);

        assert_eq!(batch.bid_count, 2);
        assert_eq!(batch.bids()[0], LevelEntry::new(100.0, 2.0));
        assert_eq!(batch.bids()[1], LevelEntry::new(99.0, 3.0));
        assert_eq!(batch.asks(), &[LevelEntry::new(101.0, 1.0)]);
    }

    #[test]
    fn test_bid_count_past_end_is_clamped() {
        let mut batch = UpdateBatch::new(1).with_bids(&[(100.0, 1.0)]);
        batch.bid_count = 5;
        assert_eq!(batch.bids().len(), 1);
        assert!(batch.asks().is_empty());
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut batch = UpdateBatch::new(7)
            .with_last_id(9)
            .snapshot()
            .with_bids(&[(1.0, 1.0); 32]);
        let capacity = batch.levels.capacity();

        batch.reset();

        assert_eq!(batch.arrival_index, 0);
        assert!(!batch.is_snapshot);
        assert!(batch.levels.is_empty());
        assert_eq!(batch.levels.capacity(), capacity);
    }

    #[test]
    fn test_content_eq_uses_epsilon() {
        let a = UpdateBatch::new(3).with_last_id(10).with_bids(&[(0.3, 1.0)]);
        let b = UpdateBatch::new(3)
            .with_last_id(10)
            .with_bids(&[(0.1 + 0.2, 1.0)]);
        let c = UpdateBatch::new(3).with_last_id(10).with_bids(&[(0.3, 2.0)]);

        assert!(a.content_eq(&b));
        assert!(!a.content_eq(&c));
    }

    #[test]
    fn test_versioned_levels() {
        let mut a = UpdateBatch::new(4);
        a.push_ask_with_seq(101.0, 1.0, 7);
        a.push_bid_with_seq(100.0, 2.0, 8);
        assert!(a.levels_with_seq);
        assert_eq!(a.bid_count, 1);
        assert_eq!(a.bids()[0].seq, 8);
        assert_eq!(a.asks()[0].seq, 7);
        assert!(a.to_string().contains("[100,2,8]"));

        let mut b = UpdateBatch::new(4);
        b.push_ask_with_seq(101.0, 1.0, 7);
        b.push_bid_with_seq(100.0, 2.0, 9);
        assert!(!a.content_eq(&b));

        a.reset();
        assert!(!a.levels_with_seq);
    }

    #[test]
    fn test_summary_omits_levels() {
        let batch = UpdateBatch::new(5).with_bids(&[(123.5, 1.0)]);
        assert!(batch.summary().contains("arrival_index=5"));
        assert!(!batch.summary().contains("123.5"));
        assert!(batch.to_string().contains("123.5"));
    }
}
