//! Reorder buffer: pending update batches, sorted by arrival index.
//!
//! Batches arrive from several reader tasks and may be out of order or
//! repeated. The buffer keeps them in a doubly linked list (nodes in an arena,
//! linked by index) sorted by `arrival_index`, so the engine can drain from the
//! head while the chain connects. Released batches go to a pool and are handed
//! back out by [`ReorderBuffer::acquire`] with their level storage intact.

use tracing::warn;

use crate::error::Error;
use crate::types::batch::DEFAULT_LEVEL_CAPACITY;
use crate::types::UpdateBatch;
use crate::Result;

const NIL: usize = usize::MAX;

/// Batches kept for reuse; anything released past this is dropped
const MAX_POOLED: usize = 1024;

/// Stable handle to a buffered batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Result of a successful [`ReorderBuffer::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Batch is now buffered
    Inserted(NodeId),
    /// Same arrival index already buffered; dropped because duplicates are tolerated
    DuplicateIgnored,
    /// Same arrival index and same content already buffered; dropped
    DuplicateButEqual,
}

#[derive(Debug)]
struct Node {
    key: i64,
    batch: Option<UpdateBatch>,
    prev: usize,
    next: usize,
}

/// Sorted doubly linked list of pending batches with a batch pool
#[derive(Debug)]
pub struct ReorderBuffer {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
    ignore_duplicates: bool,
    pool: Vec<UpdateBatch>,
}

impl ReorderBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new(ignore_duplicates: bool) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
            ignore_duplicates,
            pool: Vec::new(),
        }
    }

    /// Number of buffered batches
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take a cleared batch from the pool, or allocate one.
    ///
    /// The batch has room for at least `capacity_hint` levels.
    pub fn acquire(&mut self, capacity_hint: usize, with_level_seq: bool) -> UpdateBatch {
        let mut batch = self
            .pool
            .pop()
            .unwrap_or_else(|| UpdateBatch::new(0));
        let wanted = capacity_hint.max(DEFAULT_LEVEL_CAPACITY);
        if batch.levels.capacity() < wanted {
            batch.levels.reserve(wanted);
        }
        batch.levels_with_seq = with_level_seq;
        batch
    }

    /// Clear a batch and keep it for reuse
    pub fn release(&mut self, mut batch: UpdateBatch) {
        if self.pool.len() < MAX_POOLED {
            batch.reset();
            self.pool.push(batch);
        }
    }

    /// Batches waiting in the pool
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    fn alloc(&mut self, batch: UpdateBatch) -> usize {
        let node = Node {
            key: batch.arrival_index,
            batch: Some(batch),
            prev: NIL,
            next: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Insert a batch in arrival order.
    ///
    /// A rejected batch goes back to the pool and the buffer is unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKey`] if `arrival_index` is zero
    /// - [`Error::DuplicateConflict`] if a different batch with the same key is buffered
    /// - [`Error::BufferPushFailed`] if no position exists (corrupt links)
    pub fn push(&mut self, batch: UpdateBatch) -> Result<PushOutcome> {
        let key = batch.arrival_index;
        if key == 0 {
            self.release(batch);
            return Err(Error::InvalidKey);
        }

        if self.len == 0 {
            let idx = self.alloc(batch);
            self.head = idx;
            self.tail = idx;
            self.len = 1;
            return Ok(PushOutcome::Inserted(NodeId(idx)));
        }

        if key > self.nodes[self.tail].key {
            let idx = self.alloc(batch);
            self.nodes[idx].prev = self.tail;
            self.nodes[self.tail].next = idx;
            self.tail = idx;
            self.len += 1;
            return Ok(PushOutcome::Inserted(NodeId(idx)));
        }

        if key < self.nodes[self.head].key {
            let idx = self.alloc(batch);
            self.nodes[idx].next = self.head;
            self.nodes[self.head].prev = idx;
            self.head = idx;
            self.len += 1;
            return Ok(PushOutcome::Inserted(NodeId(idx)));
        }

        // late arrivals land near the tail, so scan from there
        let mut cursor = self.tail;
        while cursor != NIL {
            let cursor_key = self.nodes[cursor].key;
            if key == cursor_key {
                return self.reject_duplicate(batch, cursor);
            }
            let prev = self.nodes[cursor].prev;
            if key < cursor_key && prev != NIL && key > self.nodes[prev].key {
                let idx = self.alloc(batch);
                self.nodes[idx].prev = prev;
                self.nodes[idx].next = cursor;
                self.nodes[prev].next = idx;
                self.nodes[cursor].prev = idx;
                self.len += 1;
                return Ok(PushOutcome::Inserted(NodeId(idx)));
            }
            cursor = prev;
        }

        let message = format!(
            "no position for arrival_index {key} between head {} and tail {} ({} buffered)",
            self.nodes[self.head].key, self.nodes[self.tail].key, self.len
        );
        self.release(batch);
        Err(Error::BufferPushFailed(message))
    }

    fn reject_duplicate(&mut self, batch: UpdateBatch, existing: usize) -> Result<PushOutcome> {
        if self.ignore_duplicates {
            self.release(batch);
            return Ok(PushOutcome::DuplicateIgnored);
        }
        let equal = self.nodes[existing]
            .batch
            .as_ref()
            .is_some_and(|buffered| buffered.content_eq(&batch));
        if equal {
            self.release(batch);
            return Ok(PushOutcome::DuplicateButEqual);
        }
        if let Some(buffered) = self.nodes[existing].batch.as_ref() {
            warn!(
                pending = %batch,
                buffered = %buffered,
                "same arrival_index but different content"
            );
        }
        let arrival_index = batch.arrival_index;
        self.release(batch);
        Err(Error::DuplicateConflict { arrival_index })
    }

    /// First (lowest arrival index) batch
    #[must_use]
    pub fn front(&self) -> Option<&UpdateBatch> {
        if self.head == NIL {
            return None;
        }
        self.nodes[self.head].batch.as_ref()
    }

    /// Handle of the first batch
    #[must_use]
    pub fn front_id(&self) -> Option<NodeId> {
        (self.head != NIL).then_some(NodeId(self.head))
    }

    /// Batch behind a handle, if it is still buffered
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&UpdateBatch> {
        self.nodes.get(id.0).and_then(|node| node.batch.as_ref())
    }

    /// Remove and return the first batch
    pub fn pop_front(&mut self) -> Option<UpdateBatch> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        let next = self.nodes[idx].next;
        if next == NIL {
            self.head = NIL;
            self.tail = NIL;
        } else {
            self.nodes[next].prev = NIL;
            self.head = next;
        }
        self.len -= 1;
        self.free.push(idx);
        let node = &mut self.nodes[idx];
        node.next = NIL;
        node.batch.take()
    }

    /// Remove the first batch and return it to the pool
    pub fn discard_front(&mut self) {
        if let Some(batch) = self.pop_front() {
            self.release(batch);
        }
    }

    /// Discard every batch strictly before `anchor`; `anchor` becomes the head
    pub fn remove_left_of(&mut self, anchor: NodeId) {
        if self.get(anchor).is_none() {
            return;
        }
        let mut cursor = self.nodes[anchor.0].prev;
        while cursor != NIL {
            let prev = self.nodes[cursor].prev;
            if let Some(batch) = self.nodes[cursor].batch.take() {
                self.release(batch);
            }
            self.nodes[cursor].prev = NIL;
            self.nodes[cursor].next = NIL;
            self.free.push(cursor);
            self.len -= 1;
            cursor = prev;
        }
        self.nodes[anchor.0].prev = NIL;
        self.head = anchor.0;
    }

    /// Most recently ordered snapshot in the buffer
    #[must_use]
    pub fn find_last_snapshot(&self) -> Option<NodeId> {
        let mut cursor = self.tail;
        while cursor != NIL {
            let node = &self.nodes[cursor];
            if node.batch.as_ref().is_some_and(|b| b.is_snapshot) {
                return Some(NodeId(cursor));
            }
            cursor = node.prev;
        }
        None
    }

    /// Discard everything, returning the batches to the pool
    pub fn clear(&mut self) {
        while let Some(batch) = self.pop_front() {
            self.release(batch);
        }
    }

    /// Buffered arrival indices, head to tail
    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.iter().map(|batch| batch.arrival_index)
    }

    /// Buffered batches, head to tail
    pub fn iter(&self) -> impl Iterator<Item = &UpdateBatch> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            while cursor != NIL {
                let node = &self.nodes[cursor];
                cursor = node.next;
                if node.batch.is_some() {
                    return node.batch.as_ref();
                }
            }
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn batch(key: i64) -> UpdateBatch {
        UpdateBatch::new(key).with_last_id(key).with_bids(&[(100.0, 1.0)])
    }

    #[test]
    fn test_zero_key_rejected() {
        let mut buffer = ReorderBuffer::new(false);
        assert!(matches!(buffer.push(batch(0)), Err(Error::InvalidKey)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.pooled(), 1);
    }

    #[test]
    fn test_permutations_drain_sorted() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let mut keys: Vec<i64> = (1..=40).collect();
            keys.shuffle(&mut rng);

            let mut buffer = ReorderBuffer::new(false);
            for &key in &keys {
                assert!(matches!(buffer.push(batch(key)), Ok(PushOutcome::Inserted(_))));
            }
            assert_eq!(buffer.len(), 40);

            let drained: Vec<i64> = std::iter::from_fn(|| buffer.pop_front())
                .map(|b| b.arrival_index)
                .collect();
            assert_eq!(drained, (1..=40).collect::<Vec<_>>());
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_duplicate_equal_is_non_fatal() {
        let mut buffer = ReorderBuffer::new(false);
        buffer.push(batch(1)).unwrap();
        buffer.push(batch(5)).unwrap();
        buffer.push(batch(3)).unwrap();

        let outcome = buffer.push(batch(3)).unwrap();
        assert_eq!(outcome, PushOutcome::DuplicateButEqual);
        assert_eq!(buffer.keys().collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_duplicate_conflict() {
        let mut buffer = ReorderBuffer::new(false);
        buffer.push(batch(2)).unwrap();
        let different = UpdateBatch::new(2).with_last_id(2).with_bids(&[(100.0, 9.0)]);

        let err = buffer.push(different).unwrap_err();
        assert!(matches!(err, Error::DuplicateConflict { arrival_index: 2 }));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.front().map(|b| b.bids()[0].amount), Some(1.0));
    }

    #[test]
    fn test_duplicate_ignored_when_tolerated() {
        let mut buffer = ReorderBuffer::new(true);
        buffer.push(batch(2)).unwrap();
        let different = UpdateBatch::new(2).with_bids(&[(1.0, 1.0)]);
        assert_eq!(buffer.push(different).unwrap(), PushOutcome::DuplicateIgnored);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_remove_left_of_snapshot() {
        let mut buffer = ReorderBuffer::new(false);
        for key in [1, 2, 3, 5, 6] {
            buffer.push(batch(key)).unwrap();
        }
        let snapshot = match buffer.push(batch(4).snapshot()).unwrap() {
            PushOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(buffer.find_last_snapshot(), Some(snapshot));
        buffer.remove_left_of(snapshot);

        assert_eq!(buffer.keys().collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(buffer.front_id(), Some(snapshot));
        assert_eq!(buffer.pooled(), 3);

        buffer.push(batch(1)).unwrap();
        assert_eq!(buffer.keys().collect::<Vec<_>>(), vec![1, 4, 5, 6]);
    }

    #[test]
    fn test_find_last_snapshot_prefers_latest() {
        let mut buffer = ReorderBuffer::new(false);
        buffer.push(batch(1).snapshot()).unwrap();
        buffer.push(batch(2)).unwrap();
        let PushOutcome::Inserted(later) = buffer.push(batch(3).snapshot()).unwrap() else {
            panic!("not inserted");
        };
        buffer.push(batch(4)).unwrap();
        assert_eq!(buffer.find_last_snapshot(), Some(later));

        buffer.clear();
        assert_eq!(buffer.find_last_snapshot(), None);
    }

    #[test]
    fn test_pool_reuses_level_storage() {
        let mut buffer = ReorderBuffer::new(false);
        let mut big = buffer.acquire(64, false);
        assert!(big.levels.capacity() >= 64);
        big.arrival_index = 9;
        big.push_bid(1.0, 1.0);
        let capacity = big.levels.capacity();

        buffer.push(big).unwrap();
        buffer.clear();
        assert_eq!(buffer.pooled(), 1);

        let reused = buffer.acquire(0, true);
        assert_eq!(reused.arrival_index, 0);
        assert!(reused.levels.is_empty());
        assert!(reused.levels_with_seq);
        assert_eq!(reused.levels.capacity(), capacity);
    }

    #[test]
    fn test_node_slots_recycled() {
        let mut buffer = ReorderBuffer::new(false);
        for round in 0..10 {
            for key in 1..=5 {
                buffer.push(batch(round * 10 + key)).unwrap();
            }
            while buffer.pop_front().is_some() {}
        }
        assert!(buffer.nodes.len() <= 5);
    }
}
