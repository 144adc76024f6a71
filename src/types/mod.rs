//! Core data types shared by the buffer, the price-level maps and the engine.
//!
//! - [`batch`] - [`UpdateBatch`], one exchange push awaiting resequencing
//! - [`depth`] - the materialized top-N view handed to consumers

pub mod batch;
pub mod depth;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use batch::{LevelEntry, UpdateBatch};
pub use depth::{Depth, DepthLevel};

/// Price of a level. Exchanges publish decimal strings, so prices stay `f64`
/// and are compared with [`EPSILON`] rather than bitwise.
pub type Price = f64;

/// Resting amount at a level
pub type Amount = f64;

/// Timestamp in milliseconds since Unix epoch
pub type TimestampMs = i64;

/// Tolerance for "is this the same price / amount".
///
/// Re-sent levels can differ in the last bit after parsing.
pub const EPSILON: f64 = 1e-10;

/// Epsilon comparison used for every price-identity and amount-change check
#[inline]
#[must_use]
pub fn almost_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

/// Wall clock in milliseconds since Unix epoch
#[must_use]
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy interest, best (highest) price first
    Bid,
    /// Sell interest, best (lowest) price first
    Ask,
}

impl Side {
    /// Whether `a` sorts strictly before `b` on this side
    #[inline]
    #[must_use]
    pub fn precedes(self, a: Price, b: Price) -> bool {
        match self {
            Side::Bid => a > b,
            Side::Ask => a < b,
        }
    }
}
