//! Exchange-specific collaborators of the engine.
//!
//! The engine knows how to resequence, apply and rebuild; it does not know how
//! an exchange chains its update ids or where snapshots come from. A
//! [`BookSync`] implementation supplies both.

use std::future::Future;

use tracing::{error, warn};

use crate::types::UpdateBatch;
use crate::Result;

/// Per-exchange continuity rules and snapshot source
pub trait BookSync: Send + Sync + 'static {
    /// Fetch a snapshot for a rebuild.
    ///
    /// `Ok(None)` means the snapshot will arrive inline on the stream instead.
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Option<UpdateBatch>>> + Send;

    /// Whether `candidate` is the first delta to apply on top of `snapshot`
    fn first_match(&self, snapshot: &UpdateBatch, candidate: &UpdateBatch) -> bool;

    /// Whether `candidate` continues a book whose last applied id is `update_id`
    fn connects(&self, first_matched: bool, update_id: i64, candidate: &UpdateBatch) -> bool;

    /// The book cannot continue (corrupt buffer). The owner should tear down
    /// the stream.
    fn on_exit(&self, reason: &str) {
        error!(reason, "order book requested exit");
    }

    /// Operator-facing alert
    fn alert(&self, message: &str) {
        warn!(message, "order book alert");
    }
}

/// Common update-id chaining schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainRule {
    /// Each delta reports the previous delta's last id (`pu`). The first delta
    /// after a snapshot is the one whose `[first_id, last_id]` covers the
    /// snapshot id.
    #[default]
    PrevLastId,
    /// Ids increase by exactly one per batch; any delta may follow a snapshot
    Consecutive,
}

impl ChainRule {
    /// First delta to apply after `snapshot`
    #[must_use]
    pub fn first_match(self, snapshot: &UpdateBatch, candidate: &UpdateBatch) -> bool {
        match self {
            ChainRule::PrevLastId => {
                candidate.first_id <= snapshot.prev_last_id
                    && candidate.last_id >= snapshot.prev_last_id
            }
            ChainRule::Consecutive => true,
        }
    }

    /// Whether `candidate` follows `update_id`
    #[must_use]
    pub fn connects(self, update_id: i64, candidate: &UpdateBatch) -> bool {
        match self {
            ChainRule::PrevLastId => candidate.prev_last_id == update_id,
            ChainRule::Consecutive => candidate.last_id == update_id + 1,
        }
    }
}

/// A bare rule is a complete strategy for feeds that deliver their snapshots
/// on the stream.
impl BookSync for ChainRule {
    async fn fetch_snapshot(&self) -> Result<Option<UpdateBatch>> {
        Ok(None)
    }

    fn first_match(&self, snapshot: &UpdateBatch, candidate: &UpdateBatch) -> bool {
        ChainRule::first_match(*self, snapshot, candidate)
    }

    fn connects(&self, _first_matched: bool, update_id: i64, candidate: &UpdateBatch) -> bool {
        ChainRule::connects(*self, update_id, candidate)
    }
}
