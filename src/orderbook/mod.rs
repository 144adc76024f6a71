//! Resequencing order book.
//!
//! This module provides the engine and the structures it is built from:
//!
//! - [`ReorderBuffer`] - pending batches sorted by arrival index
//! - [`PriceLevelMap`] - one side of the book, a skip list keyed by price
//! - [`ChangeStats`] - per-level change counters and recent history
//! - [`OrderBook`] - gap detection, snapshot rebuild, crossed-book correction
//!
//! # Example
//!
//! ```rust
//! use book_resync::orderbook::PriceLevelMap;
//! use book_resync::types::Side;
//!
//! let mut bids = PriceLevelMap::new(Side::Bid);
//! bids.update(100.0, 2.0, 0);
//! bids.update(101.0, 1.0, 0);
//! bids.update(100.0, 0.0, 1);
//!
//! assert_eq!(bids.first().map(|l| l.price), Some(101.0));
//! assert_eq!(bids.len(), 1);
//! ```

pub mod engine;
pub mod gate;
pub mod level_map;
pub mod reorder;
pub mod stats;
pub mod strategy;

mod rebuild;
mod state;

pub use engine::OrderBook;
pub use gate::{RebuildGate, RebuildLease};
pub use level_map::{PriceLevel, PriceLevelMap};
pub use reorder::{NodeId, PushOutcome, ReorderBuffer};
pub use state::SyncState;
pub use stats::{Change, ChangeStats};
pub use strategy::{BookSync, ChainRule};
