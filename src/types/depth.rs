//! Materialized top-of-book view.

use serde::{Deserialize, Serialize};

use super::{Amount, Price};

/// One row of the depth view
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price
    pub price: Price,
    /// Resting amount
    pub amount: Amount,
}

/// Bounded copy of both sides, best first.
///
/// The engine rebuilds this under its own lock after every change, so readers
/// never hold the book lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    /// `update_id` of the book when this copy was taken
    pub update_id: i64,
    /// Exchange `seq` of the book when this copy was taken
    pub seq: i64,
    /// Bids, highest price first
    #[serde(rename = "b")]
    pub bids: Vec<DepthLevel>,
    /// Asks, lowest price first
    #[serde(rename = "a")]
    pub asks: Vec<DepthLevel>,
}

impl Depth {
    /// Best bid, if any
    #[must_use]
    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.bids.first().copied()
    }

    /// Best ask, if any
    #[must_use]
    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.asks.first().copied()
    }

    /// Average of best bid and best ask
    #[must_use]
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    /// Best ask minus best bid
    #[must_use]
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Check if the view is crossed (best bid >= best ask)
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Check if both sides are empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Clear both sides, keeping allocations
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.update_id = 0;
        self.seq = 0;
    }

    /// Copy of at most `levels` rows per side (`0` means all)
    #[must_use]
    pub fn top(&self, levels: usize) -> (Vec<(Price, Amount)>, Vec<(Price, Amount)>) {
        let take = if levels == 0 { usize::MAX } else { levels };
        let rows = |side: &[DepthLevel]| -> Vec<(Price, Amount)> {
            side.iter()
                .take(take)
                .map(|level| (level.price, level.amount))
                .collect()
        };
        (rows(&self.bids), rows(&self.asks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Depth {
        Depth {
            update_id: 10,
            seq: 3,
            bids: vec![
                DepthLevel { price: 99.0, amount: 1.0 },
                DepthLevel { price: 98.0, amount: 2.0 },
            ],
            asks: vec![
                DepthLevel { price: 101.0, amount: 1.5 },
                DepthLevel { price: 102.0, amount: 2.5 },
            ],
        }
    }

    #[test]
    fn test_mid_and_spread() {
        let depth = sample();
        assert_eq!(depth.mid_price(), Some(100.0));
        assert_eq!(depth.spread(), Some(2.0));
        assert!(!depth.is_crossed());
    }

    #[test]
    fn test_top_levels() {
        let depth = sample();
        let (bids, asks) = depth.top(1);
        assert_eq!(bids, vec![(99.0, 1.0)]);
        assert_eq!(asks, vec![(101.0, 1.5)]);

        let (bids, asks) = depth.top(0);
        assert_eq!(bids.len(), 2);
        assert_eq!(asks.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut depth = sample();
        depth.clear();
        assert!(depth.is_empty());
        assert_eq!(depth.update_id, 0);
    }
}
