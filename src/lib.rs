//! # book-resync
//!
//! A limit-order-book engine that rebuilds a correct book from an unreliable
//! exchange feed.
//!
//! ## Features
//!
//! - **Resequencing** - batches that arrive out of order are held in a sorted
//!   buffer and applied in arrival-index order
//! - **Gap detection** - a break in the update-id chain starts a timer; if it
//!   outlives the timeout a snapshot rebuild runs in the background
//! - **Snapshot rebuild** - REST or inline snapshots, replay of buffered
//!   deltas, bounded concurrency across processes
//! - **Crossed-book correction** - a crossed top of book is trimmed on the
//!   side the batch did not touch
//! - **Per-level statistics** - change counts and a short history per level
//!
//! ## Quick Start
//!
//! ```rust
//! use book_resync::orderbook::{ChainRule, OrderBook};
//! use book_resync::types::UpdateBatch;
//! use book_resync::BookConfig;
//!
//! let book = OrderBook::new(BookConfig::new("binance", "BTCUSDT"), ChainRule::PrevLastId);
//!
//! let snapshot = UpdateBatch::new(1)
//!     .snapshot()
//!     .with_last_id(100)
//!     .with_prev_last_id(100)
//!     .with_bids(&[(99.0, 1.0)])
//!     .with_asks(&[(101.0, 2.0)]);
//! book.insert_slot(snapshot, 1_000);
//!
//! let delta = UpdateBatch::new(2)
//!     .with_first_id(101)
//!     .with_last_id(105)
//!     .with_prev_last_id(100)
//!     .with_bids(&[(99.5, 3.0)]);
//! book.insert_slot(delta, 1_001);
//!
//! assert_eq!(book.update_id(), 105);
//! assert_eq!(book.best_bid(), Some((99.5, 3.0)));
//! ```
//!
//! ## Architecture
//!
//! - [`orderbook`] - the engine, reorder buffer, skip-list price levels and
//!   the [`orderbook::BookSync`] seam for exchange-specific rules
//! - [`client`] - HTTP depth-snapshot client
//! - [`types`] - update batches and depth views
//! - [`config`] - per-book and rebuild settings
//! - [`error`] - error types for the crate

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod orderbook;
pub mod types;

// Re-export main types at crate root for convenience
pub use config::{BookConfig, DepthLevels, RebuildConfig, SnapshotSource};
pub use error::Error;
pub use orderbook::{BookSync, ChainRule, OrderBook};
pub use types::{Depth, Side, UpdateBatch};

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;
