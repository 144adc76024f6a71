//! Configuration for an order book engine.
//!
//! [`BookConfig`] carries the per-stream knobs (snapshot source, duplicate
//! tolerance, depth materialization) and [`RebuildConfig`] the bounds of the
//! resynchronization protocol. Defaults match the production constants.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where snapshots come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotSource {
    /// Pulled over a separate request (REST); a background rebuild owns progress
    #[default]
    Rest,
    /// Delivered inline on the stream, continuity guaranteed by `seq`
    WsWithSeq,
    /// Delivered inline on the stream, continuity guaranteed by timestamps
    WsWithTs,
}

impl SnapshotSource {
    /// Whether snapshots arrive embedded in the delta feed
    #[must_use]
    pub fn is_inline(self) -> bool {
        !matches!(self, SnapshotSource::Rest)
    }
}

/// How many levels per side the depth view keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthLevels {
    /// No depth view; only the book is maintained
    Disabled,
    /// Every level
    #[default]
    All,
    /// At most this many levels per side
    Top(usize),
}

/// Bounds for the rebuild protocol
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use book_resync::config::RebuildConfig;
///
/// let rebuild = RebuildConfig::new()
///     .with_max_attempts(3)
///     .with_retry_delay(Duration::from_millis(500));
///
/// assert_eq!(rebuild.max_attempts(), 3);
/// assert_eq!(rebuild.max_concurrent(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    max_attempts: u32,
    retry_delay: Duration,
    min_fetch_interval: Duration,
    fetch_throttle_delay: Duration,
    marker_dir: PathBuf,
    max_concurrent: usize,
    active_window: Duration,
    stale_after: Duration,
    busy_delay: Duration,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
            min_fetch_interval: Duration::from_secs(1),
            fetch_throttle_delay: Duration::from_secs(2),
            marker_dir: std::env::temp_dir().join("book-resync.rebuild"),
            max_concurrent: 3,
            active_window: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            busy_delay: Duration::from_secs(5),
        }
    }
}

impl RebuildConfig {
    /// Create a rebuild config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of fetch attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay after a failed fetch
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set fetch throttling: minimum spacing, and the wait applied when violated
    #[must_use]
    pub fn with_fetch_throttle(mut self, min_interval: Duration, delay: Duration) -> Self {
        self.min_fetch_interval = min_interval;
        self.fetch_throttle_delay = delay;
        self
    }

    /// Set the marker directory root
    #[must_use]
    pub fn with_marker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.marker_dir = dir.into();
        self
    }

    /// Set the concurrency cap and the wait applied when it is reached
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize, busy_delay: Duration) -> Self {
        self.max_concurrent = max;
        self.busy_delay = busy_delay;
        self
    }

    /// Set how long a marker counts as active, and when it is swept
    #[must_use]
    pub fn with_marker_lifetime(mut self, active_window: Duration, stale_after: Duration) -> Self {
        self.active_window = active_window;
        self.stale_after = stale_after;
        self
    }

    /// Snapshot fetch attempts per rebuild
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after a failed fetch
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Minimum spacing between consecutive fetches
    pub fn min_fetch_interval(&self) -> Duration {
        self.min_fetch_interval
    }

    /// Wait applied when the previous fetch was too recent
    pub fn fetch_throttle_delay(&self) -> Duration {
        self.fetch_throttle_delay
    }

    /// Root directory for cross-process rebuild markers
    pub fn marker_dir(&self) -> &Path {
        &self.marker_dir
    }

    /// Concurrent rebuilds allowed per exchange before backing off
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// A marker younger than this counts as an active rebuild
    pub fn active_window(&self) -> Duration {
        self.active_window
    }

    /// Markers older than this are removed
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Wait applied when the exchange already has `max_concurrent` rebuilds
    pub fn busy_delay(&self) -> Duration {
        self.busy_delay
    }
}

/// Configuration for one order book
///
/// # Example
///
/// ```rust
/// use book_resync::config::{BookConfig, DepthLevels, SnapshotSource};
///
/// let config = BookConfig::new("bybit", "BTCUSDT")
///     .with_snapshot_source(SnapshotSource::WsWithSeq)
///     .with_depth_levels(DepthLevels::Top(50));
///
/// assert_eq!(config.name(), "[BTCUSDT@bybit]");
/// ```
#[derive(Debug, Clone)]
pub struct BookConfig {
    exchange: String,
    pair: String,
    snapshot_source: SnapshotSource,
    erase_on_snapshot: bool,
    ignore_duplicates: bool,
    depth_levels: DepthLevels,
    auto_update_depth: bool,
    gap_timeout: Duration,
    wait_snapshot_limit: u32,
    channel_capacity: usize,
    max_level: usize,
    rebuild: RebuildConfig,
}

impl BookConfig {
    /// Create a configuration for `pair` on `exchange`
    pub fn new(exchange: impl Into<String>, pair: impl Into<String>) -> Self {
        let exchange = exchange.into();
        // phemex re-sends seq values; it pushes a fresh snapshot every minute
        // so the damage from ignoring a duplicate is bounded
        let ignore_duplicates = exchange.starts_with("phemex");
        Self {
            exchange,
            pair: pair.into(),
            snapshot_source: SnapshotSource::default(),
            erase_on_snapshot: false,
            ignore_duplicates,
            depth_levels: DepthLevels::default(),
            auto_update_depth: true,
            gap_timeout: Duration::from_millis(10_000),
            wait_snapshot_limit: 500,
            channel_capacity: 300,
            max_level: crate::orderbook::level_map::DEFAULT_MAX_LEVEL,
            rebuild: RebuildConfig::default(),
        }
    }

    /// Set the snapshot source
    #[must_use]
    pub fn with_snapshot_source(mut self, source: SnapshotSource) -> Self {
        self.snapshot_source = source;
        self
    }

    /// Clear the reorder buffer whenever a snapshot arrives.
    ///
    /// Only valid for single-reader feeds that the exchange pushes in order.
    #[must_use]
    pub fn with_erase_on_snapshot(mut self, erase: bool) -> Self {
        self.erase_on_snapshot = erase;
        self
    }

    /// Drop duplicate arrival indices silently instead of comparing content
    #[must_use]
    pub fn with_ignore_duplicates(mut self, ignore: bool) -> Self {
        self.ignore_duplicates = ignore;
        self
    }

    /// Set how many levels the depth view keeps
    #[must_use]
    pub fn with_depth_levels(mut self, levels: DepthLevels) -> Self {
        self.depth_levels = levels;
        self
    }

    /// Rebuild the depth view after every change (default), or leave it to
    /// explicit `update_depth` calls
    #[must_use]
    pub fn with_auto_update_depth(mut self, auto: bool) -> Self {
        self.auto_update_depth = auto;
        self
    }

    /// Set how long a gap may persist before a rebuild is launched
    #[must_use]
    pub fn with_gap_timeout(mut self, timeout: Duration) -> Self {
        self.gap_timeout = timeout;
        self
    }

    /// Set how many deltas may arrive while awaiting an inline snapshot
    #[must_use]
    pub fn with_wait_snapshot_limit(mut self, limit: u32) -> Self {
        self.wait_snapshot_limit = limit;
        self
    }

    /// Set the input channel capacity
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the skip list height cap
    #[must_use]
    pub fn with_max_level(mut self, max_level: usize) -> Self {
        self.max_level = max_level;
        self
    }

    /// Set the rebuild bounds
    #[must_use]
    pub fn with_rebuild(mut self, rebuild: RebuildConfig) -> Self {
        self.rebuild = rebuild;
        self
    }

    /// Exchange name
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Trading pair
    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Display name used in logs
    pub fn name(&self) -> String {
        format!("[{}@{}]", self.pair, self.exchange)
    }

    /// Snapshot source
    pub fn snapshot_source(&self) -> SnapshotSource {
        self.snapshot_source
    }

    /// Whether snapshots clear the buffer
    pub fn erase_on_snapshot(&self) -> bool {
        self.erase_on_snapshot
    }

    /// Whether duplicates are dropped silently
    pub fn ignore_duplicates(&self) -> bool {
        self.ignore_duplicates
    }

    /// Depth view size
    pub fn depth_levels(&self) -> DepthLevels {
        self.depth_levels
    }

    /// Whether the depth view is rebuilt automatically
    pub fn auto_update_depth(&self) -> bool {
        self.auto_update_depth
    }

    /// Gap timeout
    pub fn gap_timeout(&self) -> Duration {
        self.gap_timeout
    }

    /// Gap timeout in milliseconds
    pub fn gap_timeout_ms(&self) -> i64 {
        i64::try_from(self.gap_timeout.as_millis()).unwrap_or(i64::MAX)
    }

    /// Inline snapshot wait limit
    pub fn wait_snapshot_limit(&self) -> u32 {
        self.wait_snapshot_limit
    }

    /// Input channel capacity
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Skip list height cap
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Rebuild bounds
    pub fn rebuild(&self) -> &RebuildConfig {
        &self.rebuild
    }

    /// Marker directory for this exchange
    pub fn marker_path(&self) -> PathBuf {
        self.rebuild.marker_dir.join(&self.exchange)
    }
}
