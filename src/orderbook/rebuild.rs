//! Background snapshot rebuild.
//!
//! Launched by the engine when a gap outlives the timeout or an inline
//! snapshot never shows up. The fetch happens outside the book lock; applying
//! the snapshot and replaying the buffer happen inside it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::SnapshotSource;
use crate::error::Error;
use crate::types::TimestampMs;

use super::engine::Shared;
use super::state::SyncState;
use super::strategy::BookSync;

pub(crate) async fn run<S: BookSync>(shared: Arc<Shared<S>>, launched_ms: TimestampMs) {
    // whatever sat in the input channel predates the snapshot
    shared.invalidate_queued();

    let started = Instant::now();
    let clock = || {
        launched_ms.saturating_add(i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX))
    };
    let settings = shared.config.rebuild();
    let book = shared.name.as_str();

    let _lease = match shared.gate.acquire(book).await {
        Ok(lease) => lease,
        Err(e) => {
            give_up(&shared, &e, clock());
            return;
        }
    };

    for attempt in 1..=settings.max_attempts() {
        if shared.stopped.load(Ordering::Acquire) {
            debug!(book, "book stopped, rebuild abandoned");
            return;
        }

        let too_soon = shared
            .last_fetch
            .lock()
            .is_some_and(|at| at.elapsed() < settings.min_fetch_interval());
        if too_soon {
            tokio::time::sleep(settings.fetch_throttle_delay()).await;
        }

        let fetched = shared.strategy.fetch_snapshot().await;
        *shared.last_fetch.lock() = Some(Instant::now());

        let snapshot = match fetched {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(book, "no snapshot fetched, waiting on the stream or the next timeout");
                shared.state.lock().rebuild_abandoned(clock());
                return;
            }
            Err(e) => {
                warn!(book, attempt, error = %e, "snapshot fetch failed");
                tokio::time::sleep(settings.retry_delay()).await;
                continue;
            }
        };

        if shared.stopped.load(Ordering::Acquire) {
            debug!(book, "book stopped, snapshot discarded");
            return;
        }

        {
            let mut st = shared.state.lock();
            let now = clock();
            st.apply_baseline(&snapshot, now);
            st.update_id = snapshot.prev_last_id;
            st.replay(&shared.strategy, &snapshot, now);
            if shared.config.snapshot_source() == SnapshotSource::Rest {
                st.sync_state = SyncState::Normal;
            }
            shared.materialize_depth(&st);
            info!(
                book,
                attempt,
                snapshot_id = snapshot.prev_last_id,
                update_id = st.update_id,
                pending = st.buffer.len(),
                "rebuild complete"
            );
            st.buffer.release(snapshot);
        }
        shared.rebuild_fail_count.store(0, Ordering::Release);
        return;
    }

    let exhausted = Error::RebuildExhausted {
        attempts: settings.max_attempts(),
    };
    give_up(&shared, &exhausted, clock());
}

/// Rebuild failed: alert, count it, and hand a REST book back to the gap timer
fn give_up<S: BookSync>(shared: &Shared<S>, reason: &Error, now_ms: TimestampMs) {
    let failures = shared.rebuild_fail_count.fetch_add(1, Ordering::AcqRel) + 1;
    error!(book = %shared.name, error = %reason, failures, "rebuild failed");
    shared
        .strategy
        .alert(&format!("{} rebuild failed ({failures} in a row): {reason}", shared.name));
    shared.state.lock().rebuild_abandoned(now_ms);
}
