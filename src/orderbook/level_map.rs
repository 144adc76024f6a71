//! Ordered price-level map for one side of the book.
//!
//! A skip list stored in an arena: nodes live in a `Vec` and link to each other
//! by index, with forward links per level and a single backward link for
//! reverse iteration. Freed slots are recycled, so a book that churns through
//! levels does not keep allocating.
//!
//! Ordering is side-specific (asks ascending, bids descending) and key
//! identity uses [`almost_equal`], so a level re-sent with a last-bit
//! different price still lands on the existing node.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::error::Error;
use crate::types::{almost_equal, Amount, Price, Side, TimestampMs};
use crate::Result;

use super::stats::ChangeStats;

/// Default skip list height cap
pub const DEFAULT_MAX_LEVEL: usize = 32;

/// Fraction of nodes at level i that also appear at level i+1
const P: f64 = 0.25;

const NIL: usize = usize::MAX;
const HEAD: usize = 0;

/// A price level: price, resting amount, and its change history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceLevel {
    /// Level price
    pub price: Price,
    /// Resting amount, never zero while stored
    pub amount: Amount,
    /// Change counters and recent history
    pub stats: ChangeStats,
}

#[derive(Debug)]
struct Node {
    level: PriceLevel,
    forward: Vec<usize>,
    backward: usize,
}

/// Ordered map from price to [`PriceLevel`]
pub struct PriceLevelMap {
    side: Side,
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Levels currently in use, at least 1
    height: usize,
    max_level: usize,
    footer: usize,
    len: usize,
    update: Vec<usize>,
    rng: StdRng,
}

impl fmt::Debug for PriceLevelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriceLevelMap")
            .field("side", &self.side)
            .field("len", &self.len)
            .field("height", &self.height)
            .field("first", &self.first().map(|l| l.price))
            .field("last", &self.last().map(|l| l.price))
            .finish()
    }
}

/// Amount change computed in decimal so that e.g. `0.3 - 0.255` is `0.045`
/// rather than `0.044999999999999984`.
pub(crate) fn exact_delta(new: Amount, old: Amount) -> f64 {
    match (Decimal::from_f64(new), Decimal::from_f64(old)) {
        (Some(new_dec), Some(old_dec)) => new_dec
            .checked_sub(old_dec)
            .and_then(|d| d.to_f64())
            .unwrap_or(new - old),
        _ => new - old,
    }
}

impl PriceLevelMap {
    /// Create an empty map for `side` with the default height cap
    #[must_use]
    pub fn new(side: Side) -> Self {
        Self::with_max_level(side, DEFAULT_MAX_LEVEL)
    }

    /// Create an empty map with a custom height cap
    #[must_use]
    pub fn with_max_level(side: Side, max_level: usize) -> Self {
        Self::build(side, max_level, StdRng::from_entropy())
    }

    /// Create a map with a seeded level generator (reproducible layout)
    #[must_use]
    pub fn with_seed(side: Side, max_level: usize, seed: u64) -> Self {
        Self::build(side, max_level, StdRng::seed_from_u64(seed))
    }

    fn build(side: Side, max_level: usize, rng: StdRng) -> Self {
        let max_level = max_level.max(1);
        Self {
            side,
            nodes: vec![Node {
                level: PriceLevel::default(),
                forward: vec![NIL; max_level],
                backward: NIL,
            }],
            free: Vec::new(),
            height: 1,
            max_level,
            footer: NIL,
            len: 0,
            update: vec![HEAD; max_level],
            rng,
        }
    }

    /// Which side this map holds
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    /// Number of levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `a` sorts strictly before `b` and is not the same price
    #[inline]
    fn before(&self, a: Price, b: Price) -> bool {
        self.side.precedes(a, b) && !almost_equal(a, b)
    }

    #[inline]
    fn price_at(&self, idx: usize) -> Price {
        self.nodes[idx].level.price
    }

    /// Walk to the first node not before `price`, recording the last node
    /// visited on every level into `self.update`.
    fn find_path(&mut self, price: Price) -> usize {
        let mut current = HEAD;
        for i in (0..self.height).rev() {
            loop {
                let next = self.nodes[current].forward[i];
                if next != NIL && self.before(self.price_at(next), price) {
                    current = next;
                } else {
                    break;
                }
            }
            self.update[i] = current;
        }
        self.nodes[current].forward[0]
    }

    /// First node not before `price`, without recording the path
    fn find(&self, price: Price) -> usize {
        let mut current = HEAD;
        for i in (0..self.height).rev() {
            loop {
                let next = self.nodes[current].forward[i];
                if next != NIL && self.before(self.price_at(next), price) {
                    current = next;
                } else {
                    break;
                }
            }
        }
        self.nodes[current].forward[0]
    }

    fn find_exact(&self, price: Price) -> Option<usize> {
        let candidate = self.find(price);
        (candidate != NIL && almost_equal(self.price_at(candidate), price)).then_some(candidate)
    }

    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < self.max_level && self.rng.gen::<f64>() < P {
            height += 1;
        }
        height
    }

    fn alloc(&mut self, level: PriceLevel, height: usize) -> usize {
        if let Some(idx) = self.free.pop() {
            let node = &mut self.nodes[idx];
            node.level = level;
            node.forward.clear();
            node.forward.resize(height, NIL);
            node.backward = NIL;
            idx
        } else {
            self.nodes.push(Node {
                level,
                forward: vec![NIL; height],
                backward: NIL,
            });
            self.nodes.len() - 1
        }
    }

    /// Get the level at `price`
    #[must_use]
    pub fn get(&self, price: Price) -> Option<&PriceLevel> {
        self.find_exact(price).map(|idx| &self.nodes[idx].level)
    }

    /// Get the amount at `price`
    #[must_use]
    pub fn amount(&self, price: Price) -> Option<Amount> {
        self.get(price).map(|level| level.amount)
    }

    /// Check if a level exists at `price`
    #[must_use]
    pub fn contains(&self, price: Price) -> bool {
        self.find_exact(price).is_some()
    }

    /// Set the amount at `price`, recording the change.
    ///
    /// An existing level records `amount - old` (nothing if unchanged). A new
    /// level keeps its whole `amount` as its first history entry without
    /// touching the counters.
    pub fn set(&mut self, price: Price, amount: Amount, now_ms: TimestampMs) {
        let candidate = self.find_path(price);

        if candidate != NIL && almost_equal(self.price_at(candidate), price) {
            let level = &mut self.nodes[candidate].level;
            let delta = exact_delta(amount, level.amount);
            level.amount = amount;
            level.stats.record(delta, now_ms);
            return;
        }

        let height = self.random_height();
        if height > self.height {
            for slot in &mut self.update[self.height..height] {
                *slot = HEAD;
            }
            self.height = height;
        }

        let mut stats = ChangeStats::new();
        stats.record_initial(amount, now_ms);
        let idx = self.alloc(
            PriceLevel {
                price,
                amount,
                stats,
            },
            height,
        );

        for i in 0..height {
            let prev = self.update[i];
            self.nodes[idx].forward[i] = self.nodes[prev].forward[i];
            self.nodes[prev].forward[i] = idx;
        }

        let prev = self.update[0];
        self.nodes[idx].backward = if prev == HEAD { NIL } else { prev };
        let next = self.nodes[idx].forward[0];
        if next == NIL {
            self.footer = idx;
        } else {
            self.nodes[next].backward = idx;
        }

        self.len += 1;
    }

    /// Apply one level from a batch: zero deletes, anything else sets
    pub fn update(&mut self, price: Price, amount: Amount, now_ms: TimestampMs) {
        if amount == 0.0 {
            // deleting an absent level is routine for delta feeds
            let _ = self.delete(price);
        } else {
            self.set(price, amount, now_ms);
        }
    }

    /// Remove the level at `price`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no level matches.
    pub fn delete(&mut self, price: Price) -> Result<PriceLevel> {
        let candidate = self.find_path(price);
        if candidate == NIL || !almost_equal(self.price_at(candidate), price) {
            return Err(Error::NotFound { price });
        }
        Ok(self.unlink(candidate))
    }

    /// Unlink `idx`, which must be the successor recorded in `self.update`
    fn unlink(&mut self, idx: usize) -> PriceLevel {
        for i in 0..self.height {
            let prev = self.update[i];
            if self.nodes[prev].forward[i] != idx {
                break;
            }
            self.nodes[prev].forward[i] = self.nodes[idx].forward[i];
        }

        let prev = self.nodes[idx].backward;
        let next = self.nodes[idx].forward[0];
        if next == NIL {
            self.footer = prev;
        } else {
            self.nodes[next].backward = prev;
        }

        while self.height > 1 && self.nodes[HEAD].forward[self.height - 1] == NIL {
            self.height -= 1;
        }

        self.len -= 1;
        self.free.push(idx);
        let node = &mut self.nodes[idx];
        node.backward = NIL;
        std::mem::take(&mut node.level)
    }

    /// Remove every leading level that orders before `threshold`.
    ///
    /// Used to uncross the book: on the bid side "before" means a higher
    /// price. Returns how many levels were removed.
    pub fn remove_first_less_than(&mut self, threshold: Price) -> usize {
        let mut removed = 0;
        loop {
            let first = self.nodes[HEAD].forward[0];
            if first == NIL || !self.side.precedes(self.price_at(first), threshold) {
                break;
            }
            for slot in &mut self.update[..self.height] {
                *slot = HEAD;
            }
            self.unlink(first);
            removed += 1;
        }
        removed
    }

    /// Remove every level
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[HEAD].forward.iter_mut().for_each(|f| *f = NIL);
        self.free.clear();
        self.height = 1;
        self.footer = NIL;
        self.len = 0;
    }

    /// Best level
    #[must_use]
    pub fn first(&self) -> Option<&PriceLevel> {
        let first = self.nodes[HEAD].forward[0];
        (first != NIL).then(|| &self.nodes[first].level)
    }

    /// Worst level
    #[must_use]
    pub fn last(&self) -> Option<&PriceLevel> {
        (self.footer != NIL).then(|| &self.nodes[self.footer].level)
    }

    /// Iterate best to worst (reversible)
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            map: self,
            front: self.nodes[HEAD].forward[0],
            back: self.footer,
            remaining: self.len,
        }
    }

    /// Visit every level mutably, best first
    pub fn for_each_mut(&mut self, mut visit: impl FnMut(&mut PriceLevel)) {
        let mut idx = self.nodes[HEAD].forward[0];
        while idx != NIL {
            visit(&mut self.nodes[idx].level);
            idx = self.nodes[idx].forward[0];
        }
    }

    /// Cursor positioned before the first level
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            map: self,
            current: HEAD,
        }
    }

    /// Cursor positioned at the first level not ordering before `price`,
    /// or `None` if every level does
    pub fn seek(&self, price: Price) -> Option<Cursor<'_>> {
        let idx = self.find(price);
        (idx != NIL).then_some(Cursor {
            map: self,
            current: idx,
        })
    }

    /// Cursor positioned at the best level
    pub fn seek_to_first(&self) -> Option<Cursor<'_>> {
        let idx = self.nodes[HEAD].forward[0];
        (idx != NIL).then_some(Cursor {
            map: self,
            current: idx,
        })
    }

    /// Cursor positioned at the worst level
    pub fn seek_to_last(&self) -> Option<Cursor<'_>> {
        (self.footer != NIL).then_some(Cursor {
            map: self,
            current: self.footer,
        })
    }

    /// Levels from `from` (inclusive) up to `to` (exclusive), in map order
    pub fn range(&self, from: Price, to: Price) -> Range<'_> {
        Range {
            map: self,
            next: self.find(from),
            upper: to,
        }
    }
}

/// Double-ended iterator over a [`PriceLevelMap`], best level first
#[derive(Debug)]
pub struct Iter<'a> {
    map: &'a PriceLevelMap,
    front: usize,
    back: usize,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a PriceLevel;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = &self.map.nodes[self.front];
        self.front = node.forward[0];
        self.remaining -= 1;
        Some(&node.level)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = &self.map.nodes[self.back];
        self.back = node.backward;
        self.remaining -= 1;
        Some(&node.level)
    }
}

impl ExactSizeIterator for Iter<'_> {}

/// Bidirectional cursor. Iterating moves forward; [`Cursor::prev`] moves back.
#[derive(Debug)]
pub struct Cursor<'a> {
    map: &'a PriceLevelMap,
    current: usize,
}

impl<'a> Cursor<'a> {
    /// Level under the cursor, `None` before the first call to `next`
    #[must_use]
    pub fn current(&self) -> Option<&'a PriceLevel> {
        (self.current != HEAD).then(|| &self.map.nodes[self.current].level)
    }

    /// Step back one level. Stays put and returns `None` at the best level.
    pub fn prev(&mut self) -> Option<&'a PriceLevel> {
        if self.current == HEAD {
            return None;
        }
        let prev = self.map.nodes[self.current].backward;
        if prev == NIL {
            return None;
        }
        self.current = prev;
        Some(&self.map.nodes[prev].level)
    }

    /// Reposition at the first level not ordering before `price`.
    /// Stays put and returns `None` if there is none.
    pub fn seek(&mut self, price: Price) -> Option<&'a PriceLevel> {
        let idx = self.map.find(price);
        if idx == NIL {
            return None;
        }
        self.current = idx;
        Some(&self.map.nodes[idx].level)
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = &'a PriceLevel;

    /// Step forward one level. Stays put and returns `None` at the worst level.
    fn next(&mut self) -> Option<Self::Item> {
        let next = self.map.nodes[self.current].forward[0];
        if next == NIL {
            return None;
        }
        self.current = next;
        Some(&self.map.nodes[next].level)
    }
}

/// Bounded forward iterator returned by [`PriceLevelMap::range`]
#[derive(Debug)]
pub struct Range<'a> {
    map: &'a PriceLevelMap,
    next: usize,
    upper: Price,
}

impl<'a> Iterator for Range<'a> {
    type Item = &'a PriceLevel;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let node = &self.map.nodes[self.next];
        if !self.map.before(node.level.price, self.upper) {
            self.next = NIL;
            return None;
        }
        self.next = node.forward[0];
        Some(&node.level)
    }
}
