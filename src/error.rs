//! Error types for the book-resync crate.
//!
//! This module defines the errors raised while resequencing update batches,
//! maintaining price levels, and fetching snapshots during a rebuild.

use thiserror::Error;

/// The main error type for this crate
#[derive(Debug, Error)]
pub enum Error {
    /// Batch carried a zero arrival index (zero is the buffer's unset marker)
    #[error("invalid resequencing key: arrival_index must be nonzero")]
    InvalidKey,

    /// Two batches share an arrival index but differ in content
    #[error("duplicate batch with differing content at arrival_index {arrival_index}")]
    DuplicateConflict {
        /// The arrival index both batches carry
        arrival_index: i64,
    },

    /// Delete of a price level that is not in the map
    #[error("price level not found: {price}")]
    NotFound {
        /// Requested price
        price: f64,
    },

    /// Snapshot fetch failed (network, decode, or exchange-side error)
    #[error("snapshot fetch failed: {0}")]
    SnapshotFetchFailed(String),

    /// Every rebuild attempt failed
    #[error("rebuild failed after {attempts} attempts")]
    RebuildExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// The reorder buffer could not place a batch; the list is corrupt
    #[error("reorder buffer push failed: {0}")]
    BufferPushFailed(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error (rebuild gate markers)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Exchange returned a non-success HTTP status
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or extracted message
        message: String,
    },

    /// Rate limit exceeded
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited {
        /// Retry after this many milliseconds
        retry_after_ms: Option<u64>,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Input channel closed or engine stopped
    #[error("input channel closed")]
    ChannelClosed,
}

impl Error {
    /// Whether this error means the reorder buffer itself is no longer
    /// trustworthy and the owning process should be told to exit
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BufferPushFailed(_))
    }
}
