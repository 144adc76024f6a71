//! Book state guarded by the engine lock.
//!
//! Everything here is synchronous: resequencing, gap detection, applying
//! batches, crossed-book trimming and snapshot baselines. The async rebuild
//! task and the input channel live in [`super::engine`] and
//! [`super::rebuild`] and only ever touch this state under the lock.

use std::mem;

use tracing::{debug, error, info, warn};

use crate::config::{BookConfig, SnapshotSource};
use crate::types::{almost_equal, Side, TimestampMs, UpdateBatch};

use super::level_map::{exact_delta, PriceLevelMap};
use super::reorder::{PushOutcome, ReorderBuffer};
use super::strategy::BookSync;

/// Offset used when trimming a crossed book, so the level that caused the
/// cross is kept
const CROSS_TRIM_OFFSET: f64 = 1e-9;

/// Resynchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Applying deltas as they connect
    #[default]
    Normal,
    /// Waiting for a snapshot to show up on the stream
    AwaitingWsSnapshot,
    /// A background task is fetching a snapshot
    RestRebuilding,
}

/// What an insert did, and whether a rebuild must be launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InsertStep {
    pub changed: bool,
    pub rebuild_at: Option<TimestampMs>,
}

#[derive(Debug)]
pub(crate) struct BookState {
    pub name: String,
    pub buffer: ReorderBuffer,
    pub bids: PriceLevelMap,
    pub asks: PriceLevelMap,
    /// Maps set aside by `reset`, consulted once for stats carry-over
    retired: Option<(PriceLevelMap, PriceLevelMap)>,
    pub update_id: i64,
    pub seq: i64,
    pub received_ts_ns: i64,
    /// Engine time the current gap was first seen, 0 when healthy
    pub wrong_since_ms: TimestampMs,
    pub sync_state: SyncState,
    pub wait_snapshot_count: u32,
    source: SnapshotSource,
    erase_on_snapshot: bool,
    gap_timeout_ms: i64,
    wait_snapshot_limit: u32,
    max_level: usize,
}

impl BookState {
    pub fn new(config: &BookConfig) -> Self {
        Self {
            name: config.name(),
            buffer: ReorderBuffer::new(config.ignore_duplicates()),
            bids: PriceLevelMap::with_max_level(Side::Bid, config.max_level()),
            asks: PriceLevelMap::with_max_level(Side::Ask, config.max_level()),
            retired: None,
            update_id: 0,
            seq: 0,
            received_ts_ns: 0,
            wrong_since_ms: 0,
            sync_state: SyncState::Normal,
            wait_snapshot_count: 0,
            source: config.snapshot_source(),
            erase_on_snapshot: config.erase_on_snapshot(),
            gap_timeout_ms: config.gap_timeout_ms(),
            wait_snapshot_limit: config.wait_snapshot_limit(),
            max_level: config.max_level(),
        }
    }

    pub fn side(&self, side: Side) -> &PriceLevelMap {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn start_gap_timer(&mut self, now_ms: TimestampMs) {
        if self.wrong_since_ms == 0 {
            // 0 means healthy, so never store it as a start time
            self.wrong_since_ms = now_ms.max(1);
        }
    }

    /// Resequence one batch and apply whatever now connects
    pub fn insert<S: BookSync>(
        &mut self,
        strategy: &S,
        batch: UpdateBatch,
        now_ms: TimestampMs,
    ) -> InsertStep {
        let is_snapshot = batch.is_snapshot;
        let arrival_index = batch.arrival_index;
        let last_id = batch.last_id;

        if is_snapshot && self.erase_on_snapshot {
            self.buffer.clear();
        }

        let node = match self.buffer.push(batch) {
            Ok(PushOutcome::Inserted(node)) => node,
            Ok(outcome) => {
                debug!(book = %self.name, arrival_index, ?outcome, "duplicate batch dropped");
                return InsertStep::default();
            }
            Err(e) => {
                let message = format!(
                    "{} failed to insert batch arrival_index={arrival_index} last_id={last_id}: {e}",
                    self.name
                );
                error!(book = %self.name, arrival_index, last_id, error = %e, "failed to insert batch");
                strategy.alert(&message);
                if e.is_fatal() {
                    strategy.on_exit(&message);
                }
                return InsertStep::default();
            }
        };

        let mut changed = false;
        match self.sync_state {
            SyncState::Normal => {}
            SyncState::RestRebuilding => return InsertStep::default(),
            SyncState::AwaitingWsSnapshot => {
                if !is_snapshot {
                    // the buffer holds no snapshot, or this one would have been it
                    self.wait_snapshot_count += 1;
                    if self.wait_snapshot_count > self.wait_snapshot_limit {
                        warn!(
                            book = %self.name,
                            waited = self.wait_snapshot_count,
                            "no snapshot on the stream, rebuilding"
                        );
                        self.wait_snapshot_count = 0;
                        return InsertStep {
                            changed: false,
                            rebuild_at: Some(now_ms),
                        };
                    }
                    return InsertStep::default();
                }

                info!(book = %self.name, arrival_index, "snapshot found in buffer");
                self.buffer.remove_left_of(node);
                if let Some(snapshot) = self.buffer.pop_front() {
                    self.apply_baseline(&snapshot, now_ms);
                    self.buffer.release(snapshot);
                }
                self.wrong_since_ms = 0;
                self.wait_snapshot_count = 0;
                self.sync_state = SyncState::Normal;
                changed = true;
            }
        }

        if self.wrong_since_ms != 0 && now_ms - self.wrong_since_ms > self.gap_timeout_ms {
            self.sync_state = if self.source.is_inline() {
                SyncState::AwaitingWsSnapshot
            } else {
                SyncState::RestRebuilding
            };
            warn!(
                book = %self.name,
                update_id = self.update_id,
                gap_ms = now_ms - self.wrong_since_ms,
                pending = self.buffer.len(),
                "gap persisted, rebuilding"
            );
            return InsertStep {
                changed,
                rebuild_at: Some(now_ms),
            };
        }

        changed |= self.drain(strategy, now_ms);
        InsertStep {
            changed,
            rebuild_at: None,
        }
    }

    /// Apply buffered batches from the head while they connect
    pub fn drain<S: BookSync>(&mut self, strategy: &S, now_ms: TimestampMs) -> bool {
        let mut changed = false;
        while let Some(front) = self.buffer.front() {
            if front.is_snapshot {
                if let Some(snapshot) = self.buffer.pop_front() {
                    self.apply_baseline(&snapshot, now_ms);
                    self.buffer.release(snapshot);
                }
                self.wrong_since_ms = 0;
                changed = true;
                continue;
            }

            if front.last_id < self.update_id {
                // already covered; a newer batch may still be in flight
                self.buffer.discard_front();
                self.wrong_since_ms = 0;
                continue;
            }

            if !strategy.connects(true, self.update_id, front) {
                self.start_gap_timer(now_ms);
                break;
            }

            if let Some(batch) = self.buffer.pop_front() {
                self.apply_batch(&batch, now_ms);
                self.buffer.release(batch);
            }
            self.wrong_since_ms = 0;
            changed = true;
        }
        changed
    }

    /// Replay the buffer on top of a freshly fetched snapshot.
    ///
    /// Expects `update_id` to already hold the snapshot id. Stale batches are
    /// dropped, then the first batch accepted by `first_match` anchors the
    /// chain and the rest must connect.
    pub fn replay<S: BookSync>(&mut self, strategy: &S, snapshot: &UpdateBatch, now_ms: TimestampMs) {
        let mut matched = false;
        while let Some(front) = self.buffer.front() {
            if front.last_id < self.update_id {
                self.buffer.discard_front();
                self.wrong_since_ms = 0;
                continue;
            }

            let anchors = !matched && strategy.first_match(snapshot, front);
            if !anchors && (!matched || !strategy.connects(matched, self.update_id, front)) {
                // the head stays: it may connect once the missing batch lands
                self.start_gap_timer(now_ms);
                break;
            }

            if let Some(batch) = self.buffer.pop_front() {
                self.apply_batch(&batch, now_ms);
                self.buffer.release(batch);
            }
            matched = true;
            self.wrong_since_ms = 0;
        }
    }

    /// Apply one delta batch and uncross the book
    pub fn apply_batch(&mut self, batch: &UpdateBatch, now_ms: TimestampMs) {
        let bids = batch.bids();
        for level in bids {
            self.bids.update(level.price, level.amount, now_ms);
        }
        for level in batch.asks() {
            self.asks.update(level.price, level.amount, now_ms);
        }
        self.uncross(!bids.is_empty());

        self.update_id = batch.last_id;
        self.seq = batch.seq;
        self.received_ts_ns = batch.received_ts_ns;
    }

    /// Trim the side the batch did not drive. When the batch touched bids the
    /// asks are trimmed, even if it touched asks too.
    fn uncross(&mut self, bids_touched: bool) {
        let (Some(best_ask), Some(best_bid)) = (
            self.asks.first().map(|l| l.price),
            self.bids.first().map(|l| l.price),
        ) else {
            return;
        };
        if best_ask > best_bid {
            return;
        }

        let removed = if bids_touched {
            self.asks.remove_first_less_than(best_bid + CROSS_TRIM_OFFSET)
        } else {
            self.bids.remove_first_less_than(best_ask - CROSS_TRIM_OFFSET)
        };
        debug!(
            book = %self.name,
            best_bid,
            best_ask,
            trimmed_side = if bids_touched { "ask" } else { "bid" },
            removed,
            "crossed book trimmed"
        );
    }

    /// Replace both sides with `snapshot`, keeping the change history of
    /// levels that survive
    pub fn apply_baseline(&mut self, snapshot: &UpdateBatch, now_ms: TimestampMs) {
        let current = (
            mem::replace(
                &mut self.bids,
                PriceLevelMap::with_max_level(Side::Bid, self.max_level),
            ),
            mem::replace(
                &mut self.asks,
                PriceLevelMap::with_max_level(Side::Ask, self.max_level),
            ),
        );
        let (prev_bids, prev_asks) = self.retired.take().unwrap_or(current);

        self.apply_batch(snapshot, now_ms);
        carry_stats(&mut self.bids, &prev_bids, now_ms);
        carry_stats(&mut self.asks, &prev_asks, now_ms);

        debug!(
            book = %self.name,
            update_id = self.update_id,
            bids = self.bids.len(),
            asks = self.asks.len(),
            "snapshot applied"
        );
    }

    /// Forget everything except level history, which the next baseline
    /// picks up again
    pub fn reset(&mut self) {
        self.buffer.clear();
        let bids = mem::replace(
            &mut self.bids,
            PriceLevelMap::with_max_level(Side::Bid, self.max_level),
        );
        let asks = mem::replace(
            &mut self.asks,
            PriceLevelMap::with_max_level(Side::Ask, self.max_level),
        );
        if self.retired.is_none() {
            self.retired = Some((bids, asks));
        }
        self.update_id = 0;
        self.seq = 0;
        self.received_ts_ns = 0;
        self.wrong_since_ms = 0;
        self.wait_snapshot_count = 0;
        self.sync_state = SyncState::Normal;
    }

    /// Rebuild ended without a snapshot. A REST book goes back to normal and
    /// the next timeout retries; an inline book keeps waiting for the stream.
    pub fn rebuild_abandoned(&mut self, now_ms: TimestampMs) {
        if self.source.is_inline() {
            return;
        }
        self.sync_state = SyncState::Normal;
        self.wrong_since_ms = now_ms.max(1);
    }
}

fn carry_stats(fresh: &mut PriceLevelMap, prev: &PriceLevelMap, now_ms: TimestampMs) {
    if prev.is_empty() {
        return;
    }
    fresh.for_each_mut(|level| {
        let Some(old) = prev.get(level.price) else {
            return;
        };
        level.stats = old.stats.clone();
        if !almost_equal(level.amount, old.amount) {
            level.stats.record(exact_delta(level.amount, old.amount), now_ms);
        }
    });
}
