//! The order book engine.
//!
//! [`OrderBook`] is a cheap-to-clone handle over shared state:
//!
//! - one `parking_lot::Mutex` over the reorder buffer, both sides and the
//!   sync state
//! - one `parking_lot::RwLock` over the materialized [`Depth`], so readers
//!   never wait on the book lock
//! - an optional bounded input channel drained by a single consumer task
//!
//! Rebuilds run in the background on the tokio runtime that was current when
//! the book was created, or on a dedicated thread when there was none.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{BookConfig, DepthLevels};
use crate::error::Error;
use crate::types::{now_ms, Amount, Depth, DepthLevel, Price, Side, TimestampMs, UpdateBatch};
use crate::Result;

use super::gate::RebuildGate;
use super::level_map::PriceLevel;
use super::rebuild;
use super::state::{BookState, SyncState};
use super::strategy::BookSync;

/// Batch waiting in the input channel, tagged with the epoch it was sent in
#[derive(Debug)]
struct Queued {
    epoch: u64,
    batch: UpdateBatch,
}

pub(crate) struct Shared<S> {
    pub name: String,
    pub config: BookConfig,
    pub strategy: S,
    pub state: Mutex<BookState>,
    pub depth: RwLock<Depth>,
    pub gate: RebuildGate,
    pub rebuild_fail_count: AtomicU32,
    pub stopped: AtomicBool,
    /// Bumped to invalidate everything queued in the input channel
    pub epoch: AtomicU64,
    pub last_fetch: Mutex<Option<Instant>>,
    runtime: Option<Handle>,
    input: Mutex<Option<mpsc::Sender<Queued>>>,
}

impl<S> Shared<S> {
    /// Copy the top of both sides into the depth view
    pub fn materialize_depth(&self, st: &BookState) {
        let limit = match self.config.depth_levels() {
            DepthLevels::Disabled => return,
            DepthLevels::All => usize::MAX,
            DepthLevels::Top(n) => n,
        };
        let row = |level: &PriceLevel| DepthLevel {
            price: level.price,
            amount: level.amount,
        };

        let mut depth = self.depth.write();
        depth.update_id = st.update_id;
        depth.seq = st.seq;
        depth.bids.clear();
        depth.bids.extend(st.bids.iter().take(limit).map(row));
        depth.asks.clear();
        depth.asks.extend(st.asks.iter().take(limit).map(row));
    }

    /// Drop everything currently queued in the input channel
    pub fn invalidate_queued(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Resequencing order book for one pair on one exchange.
///
/// # Example
///
/// ```rust,no_run
/// use book_resync::config::BookConfig;
/// use book_resync::orderbook::{BookSync, ChainRule, OrderBook};
/// use book_resync::types::UpdateBatch;
///
/// struct Feed;
///
/// impl BookSync for Feed {
///     async fn fetch_snapshot(&self) -> book_resync::Result<Option<UpdateBatch>> {
///         Ok(None)
///     }
///     fn first_match(&self, snapshot: &UpdateBatch, candidate: &UpdateBatch) -> bool {
///         ChainRule::PrevLastId.first_match(snapshot, candidate)
///     }
///     fn connects(&self, _first: bool, update_id: i64, candidate: &UpdateBatch) -> bool {
///         ChainRule::PrevLastId.connects(update_id, candidate)
///     }
/// }
///
/// # async fn example() {
/// let book = OrderBook::new(BookConfig::new("binance", "BTCUSDT"), Feed);
///
/// let snapshot = UpdateBatch::new(1)
///     .snapshot()
///     .with_last_id(100)
///     .with_prev_last_id(100)
///     .with_bids(&[(99.5, 2.0)])
///     .with_asks(&[(100.5, 1.0)]);
/// book.insert_slot_now(snapshot);
///
/// println!("{:?} / {:?}", book.best_bid(), book.best_ask());
/// # }
/// ```
pub struct OrderBook<S: BookSync> {
    shared: Arc<Shared<S>>,
}

impl<S: BookSync> Clone for OrderBook<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: BookSync> OrderBook<S> {
    /// Create a book. Captures the current tokio runtime, if any, for rebuilds.
    pub fn new(config: BookConfig, strategy: S) -> Self {
        let gate = RebuildGate::new(config.marker_path(), config.rebuild());
        let state = BookState::new(&config);
        Self {
            shared: Arc::new(Shared {
                name: config.name(),
                config,
                strategy,
                state: Mutex::new(state),
                depth: RwLock::new(Depth::default()),
                gate,
                rebuild_fail_count: AtomicU32::new(0),
                stopped: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                last_fetch: Mutex::new(None),
                runtime: Handle::try_current().ok(),
                input: Mutex::new(None),
            }),
        }
    }

    /// Display name, `[pair@exchange]`
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Book configuration
    pub fn config(&self) -> &BookConfig {
        &self.shared.config
    }

    /// Exchange collaborator
    pub fn strategy(&self) -> &S {
        &self.shared.strategy
    }

    /// A cleared batch from the pool with room for `capacity` levels
    pub fn acquire_slot(&self, capacity: usize, arrival_index: i64, with_level_seq: bool) -> UpdateBatch {
        let mut batch = self
            .shared
            .state
            .lock()
            .buffer
            .acquire(capacity, with_level_seq);
        batch.arrival_index = arrival_index;
        batch
    }

    /// Resequence a batch and apply everything that now connects.
    ///
    /// `now_ms` is the engine clock used for gap timing and level stats.
    /// Returns true if the book changed.
    pub fn insert_slot(&self, batch: UpdateBatch, now_ms: TimestampMs) -> bool {
        let step = {
            let mut st = self.shared.state.lock();
            let step = st.insert(&self.shared.strategy, batch, now_ms);
            if step.changed && self.shared.config.auto_update_depth() {
                self.shared.materialize_depth(&st);
            }
            step
        };
        if let Some(launched_ms) = step.rebuild_at {
            self.spawn_rebuild(launched_ms);
        }
        step.changed
    }

    /// [`insert_slot`](Self::insert_slot) on the wall clock
    pub fn insert_slot_now(&self, batch: UpdateBatch) -> bool {
        self.insert_slot(batch, now_ms())
    }

    fn spawn_rebuild(&self, launched_ms: TimestampMs) {
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let task = rebuild::run(Arc::clone(&self.shared), launched_ms);

        if let Some(handle) = &self.shared.runtime {
            handle.spawn(task);
            return;
        }

        let spawned = std::thread::Builder::new()
            .name("book-rebuild".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(task),
                    Err(e) => error!(error = %e, "failed to start rebuild runtime"),
                }
            });
        if let Err(e) = spawned {
            error!(book = %self.shared.name, error = %e, "failed to spawn rebuild thread");
            self.shared.state.lock().rebuild_abandoned(launched_ms);
        }
    }

    /// Put a bounded channel in front of [`insert_slot`](Self::insert_slot).
    ///
    /// A single consumer task applies queued batches in order and calls
    /// `on_update` with the receipt time of the last applied batch whenever the
    /// book changed. The consumer runs until [`stop`](Self::stop) or until the
    /// last handle to the book is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there is no tokio runtime or the channel is
    /// already enabled.
    pub fn enable_channel<F>(&self, on_update: F) -> Result<()>
    where
        F: Fn(i64) + Send + 'static,
    {
        let handle = self
            .shared
            .runtime
            .clone()
            .ok_or_else(|| Error::Config("input channel needs a tokio runtime".into()))?;

        let mut rx = {
            let mut input = self.shared.input.lock();
            if input.is_some() {
                return Err(Error::Config("input channel already enabled".into()));
            }
            let (tx, rx) = mpsc::channel(self.shared.config.channel_capacity().max(1));
            *input = Some(tx);
            rx
        };

        // the consumer must not keep the book alive, or the sender it owns
        // would never drop and `recv` would never end
        let shared = Arc::downgrade(&self.shared);
        let name = self.shared.name.clone();
        handle.spawn(async move {
            info!(book = %name, "input consumer started");
            while let Some(item) = rx.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.stopped.load(Ordering::Acquire) {
                    break;
                }
                if item.epoch != shared.epoch.load(Ordering::Acquire) {
                    shared.state.lock().buffer.release(item.batch);
                    continue;
                }
                let book = OrderBook { shared };
                if book.insert_slot(item.batch, now_ms()) {
                    on_update(book.received_ts_ns());
                }
            }
            info!(book = %name, "input consumer stopped");
        });
        Ok(())
    }

    fn sender(&self) -> Result<(mpsc::Sender<Queued>, u64)> {
        let sender = self.shared.input.lock().clone().ok_or(Error::ChannelClosed)?;
        Ok((sender, self.shared.epoch.load(Ordering::Acquire)))
    }

    /// Queue a batch, waiting for room
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel is not enabled or the
    /// book was stopped.
    pub async fn send_slot(&self, batch: UpdateBatch) -> Result<()> {
        let (sender, epoch) = self.sender()?;
        sender
            .send(Queued { epoch, batch })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Queue a batch from a non-async thread, blocking for room.
    ///
    /// Must not be called from inside the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel is not enabled or the
    /// book was stopped.
    pub fn blocking_send_slot(&self, batch: UpdateBatch) -> Result<()> {
        let (sender, epoch) = self.sender()?;
        sender
            .blocking_send(Queued { epoch, batch })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Rebuild the depth view now (for books created with
    /// `with_auto_update_depth(false)`)
    pub fn update_depth(&self) {
        let st = self.shared.state.lock();
        self.shared.materialize_depth(&st);
    }

    /// Copy of the depth view, at most `levels` rows per side (`0` means all)
    pub fn get_depth(&self, levels: usize) -> Depth {
        let depth = self.shared.depth.read();
        let take = if levels == 0 { usize::MAX } else { levels };
        Depth {
            update_id: depth.update_id,
            seq: depth.seq,
            bids: depth.bids.iter().take(take).copied().collect(),
            asks: depth.asks.iter().take(take).copied().collect(),
        }
    }

    /// Visit one side best first under the book lock; return false to stop
    pub fn iterate(&self, side: Side, mut visitor: impl FnMut(&PriceLevel) -> bool) {
        let st = self.shared.state.lock();
        for level in st.side(side).iter() {
            if !visitor(level) {
                break;
            }
        }
    }

    /// Best bid price and amount
    pub fn best_bid(&self) -> Option<(Price, Amount)> {
        let st = self.shared.state.lock();
        st.bids.first().map(|l| (l.price, l.amount))
    }

    /// Best ask price and amount
    pub fn best_ask(&self) -> Option<(Price, Amount)> {
        let st = self.shared.state.lock();
        st.asks.first().map(|l| (l.price, l.amount))
    }

    /// Copy of one level, including its stats
    pub fn level(&self, side: Side, price: Price) -> Option<PriceLevel> {
        self.shared.state.lock().side(side).get(price).cloned()
    }

    /// Level counts as (bids, asks)
    pub fn num_levels(&self) -> (usize, usize) {
        let st = self.shared.state.lock();
        (st.bids.len(), st.asks.len())
    }

    /// Last applied update id
    pub fn update_id(&self) -> i64 {
        self.shared.state.lock().update_id
    }

    /// Exchange sequence of the last applied batch
    pub fn seq(&self) -> i64 {
        self.shared.state.lock().seq
    }

    /// Receipt time of the last applied batch
    pub fn received_ts_ns(&self) -> i64 {
        self.shared.state.lock().received_ts_ns
    }

    /// Current sync state
    pub fn sync_state(&self) -> SyncState {
        self.shared.state.lock().sync_state
    }

    /// Rebuilds that gave up since the last successful one
    pub fn rebuild_fail_count(&self) -> u32 {
        self.shared.rebuild_fail_count.load(Ordering::Acquire)
    }

    /// Batches waiting in the reorder buffer
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Clear the book, buffer, ids, timers and depth view. Level history is
    /// kept and reattached by the next snapshot.
    pub fn reset(&self) {
        self.shared.invalidate_queued();
        self.shared.state.lock().reset();
        self.shared.rebuild_fail_count.store(0, Ordering::Release);
        self.shared.depth.write().clear();
        info!(book = %self.shared.name, "order book reset");
    }

    /// Stop the input consumer and discard anything queued. Rebuilds in
    /// flight drop their result.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.invalidate_queued();
        self.shared.input.lock().take();
        info!(book = %self.shared.name, "order book stopped");
    }
}

impl<S: BookSync> fmt::Display for OrderBook<S> {
    /// Asks worst to best, then bids best to worst
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        writeln!(f, "===============================")?;
        for level in st.asks.iter().rev() {
            writeln!(f, "{}, {}", level.price, level.amount)?;
        }
        writeln!(f, "-------------------------------")?;
        for level in st.bids.iter() {
            writeln!(f, "{}, {}", level.price, level.amount)?;
        }
        writeln!(f, "===============================")
    }
}

impl<S: BookSync> fmt::Debug for OrderBook<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("OrderBook");
        out.field("name", &self.shared.name);
        if let Some(st) = self.shared.state.try_lock() {
            out.field("update_id", &st.update_id)
                .field("sync_state", &st.sync_state)
                .field("bids", &st.bids.len())
                .field("asks", &st.asks.len())
                .field("pending", &st.buffer.len());
        }
        out.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orderbook::strategy::ChainRule;

    struct NoFetch;

    impl BookSync for NoFetch {
        async fn fetch_snapshot(&self) -> Result<Option<UpdateBatch>> {
            Ok(None)
        }

        fn first_match(&self, snapshot: &UpdateBatch, candidate: &UpdateBatch) -> bool {
            ChainRule::Consecutive.first_match(snapshot, candidate)
        }

        fn connects(&self, _first_matched: bool, update_id: i64, candidate: &UpdateBatch) -> bool {
            ChainRule::Consecutive.connects(update_id, candidate)
        }
    }

    fn snapshot() -> UpdateBatch {
        UpdateBatch::new(1)
            .snapshot()
            .with_last_id(10)
            .with_prev_last_id(10)
            .with_bids(&[(100.0, 1.0), (99.0, 2.0), (98.0, 3.0)])
            .with_asks(&[(101.0, 1.0), (102.0, 2.0), (103.0, 3.0)])
    }

    #[test]
    fn test_depth_follows_book() {
        let book = OrderBook::new(
            BookConfig::new("test", "BTCUSDT").with_depth_levels(DepthLevels::Top(2)),
            NoFetch,
        );
        assert!(book.insert_slot(snapshot(), 1_000));

        let depth = book.get_depth(0);
        assert_eq!(depth.update_id, 10);
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.asks.len(), 2);
        assert_eq!(depth.best_bid().map(|l| l.price), Some(100.0));

        assert_eq!(book.get_depth(1).asks.len(), 1);
        assert_eq!(book.num_levels(), (3, 3));
    }

    #[test]
    fn test_manual_depth_update() {
        let book = OrderBook::new(
            BookConfig::new("test", "BTCUSDT").with_auto_update_depth(false),
            NoFetch,
        );
        book.insert_slot(snapshot(), 1_000);
        assert!(book.get_depth(0).is_empty());

        book.update_depth();
        assert_eq!(book.get_depth(0).bids.len(), 3);
    }

    #[test]
    fn test_disabled_depth_stays_empty() {
        let book = OrderBook::new(
            BookConfig::new("test", "BTCUSDT").with_depth_levels(DepthLevels::Disabled),
            NoFetch,
        );
        book.insert_slot(snapshot(), 1_000);
        book.update_depth();
        assert!(book.get_depth(0).is_empty());
        assert_eq!(book.best_ask(), Some((101.0, 1.0)));
    }

    #[test]
    fn test_iterate_stops_early() {
        let book = OrderBook::new(BookConfig::new("test", "BTCUSDT"), NoFetch);
        book.insert_slot(snapshot(), 1_000);

        let mut seen = Vec::new();
        book.iterate(Side::Ask, |level| {
            seen.push(level.price);
            seen.len() < 2
        });
        assert_eq!(seen, vec![101.0, 102.0]);
    }

    #[test]
    fn test_display_dump() {
        let book = OrderBook::new(BookConfig::new("test", "BTCUSDT"), NoFetch);
        book.insert_slot(snapshot(), 1_000);

        let dump = book.to_string();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[1], "103, 3");
        assert_eq!(lines[3], "101, 1");
        assert!(lines[4].starts_with("---"));
        assert_eq!(lines[5], "100, 1");
    }

    #[test]
    fn test_acquire_slot_and_reset() {
        let book = OrderBook::new(BookConfig::new("test", "BTCUSDT"), NoFetch);
        let mut slot = book.acquire_slot(4, 1, false);
        assert_eq!(slot.arrival_index, 1);
        slot.is_snapshot = true;
        slot.last_id = 10;
        slot.push_bid(100.0, 1.0);
        assert!(book.insert_slot(slot, 1_000));
        assert_eq!(book.update_id(), 10);

        book.reset();
        assert_eq!(book.update_id(), 0);
        assert_eq!(book.num_levels(), (0, 0));
        assert!(book.get_depth(0).is_empty());
        assert_eq!(book.sync_state(), SyncState::Normal);
    }

    #[test]
    fn test_channel_requires_runtime() {
        let book = OrderBook::new(BookConfig::new("test", "BTCUSDT"), NoFetch);
        assert!(matches!(book.enable_channel(|_| {}), Err(Error::Config(_))));
        assert!(matches!(
            book.blocking_send_slot(snapshot()),
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_channel_applies_in_order() {
        let book = OrderBook::new(BookConfig::new("test", "BTCUSDT"), NoFetch);
        let (tx, mut rx) = mpsc::unbounded_channel();
        book.enable_channel(move |ts| {
            let _ = tx.send(ts);
        })
        .unwrap();
        assert!(matches!(book.enable_channel(|_| {}), Err(Error::Config(_))));

        let mut first = snapshot();
        first.received_ts_ns = 7;
        book.send_slot(first).await.unwrap();
        let mut next = UpdateBatch::new(2).with_last_id(11).with_asks(&[(101.0, 0.0)]);
        next.received_ts_ns = 8;
        book.send_slot(next).await.unwrap();

        assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), Some(7));
        assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), Some(8));
        assert_eq!(book.best_ask(), Some((102.0, 2.0)));

        book.stop();
        assert!(book.is_stopped());
        assert!(matches!(book.send_slot(snapshot()).await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropping_book_ends_consumer() {
        let book = OrderBook::new(BookConfig::new("test", "BTCUSDT"), NoFetch);
        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
        book.enable_channel(move |ts| {
            let _ = tx.send(ts);
        })
        .unwrap();
        book.send_slot(snapshot()).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_some());

        let shared = Arc::downgrade(&book.shared);
        drop(book);
        assert!(shared.upgrade().is_none());

        // the consumer exits and drops its callback, closing `rx`
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }
}
