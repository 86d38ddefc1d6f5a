//! Append-only vector arena with a tombstone bitmap.

use std::fmt;

use instant_distance::{Builder, HnswMap, Point, Search};
use rayon::prelude::*;
use relay_core::Embedding;

use crate::error::{RagError, Result};
use crate::types::EmbeddingId;

use super::l2_distance;

/// A point wrapper for instant-distance using Euclidean distance.
#[derive(Clone, Debug)]
struct L2Point(Embedding);

impl Point for L2Point {
    fn distance(&self, other: &Self) -> f32 {
        l2_distance(&self.0, &other.0)
    }
}

/// One stored vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    /// Key of the embedding record this vector belongs to.
    pub id: EmbeddingId,
    /// The vector.
    pub vector: Embedding,
}

/// A nearest-neighbour hit: slot index and L2 distance to the query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    /// Index of the matching slot.
    pub slot: usize,
    /// Euclidean distance to the query.
    pub distance: f32,
}

/// Vectors stored in insertion order.
///
/// Slots are never removed in place. Deleting marks a slot as tombstoned, searches skip
/// tombstoned slots before ranking, and [`compacted`](Self::compacted) produces a fresh arena
/// holding only live slots.
///
/// Small arenas are searched exactly with a parallel scan. Once the live count reaches
/// `ann_threshold`, [`seal`](Self::seal) builds an HNSW graph over the live slots and searches go
/// through it.
pub struct VectorArena {
    dimension: usize,
    ann_threshold: usize,
    slots: Vec<Slot>,
    tombstones: Vec<bool>,
    live: usize,
    ann: Option<HnswMap<L2Point, usize>>,
    dirty: bool,
}

impl fmt::Debug for VectorArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorArena")
            .field("dimension", &self.dimension)
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .field("ann", &self.ann.is_some())
            .finish()
    }
}

impl VectorArena {
    /// Creates an empty arena for vectors of `dimension` components.
    #[must_use]
    pub const fn new(dimension: usize, ann_threshold: usize) -> Self {
        Self {
            dimension,
            ann_threshold,
            slots: Vec::new(),
            tombstones: Vec::new(),
            live: 0,
            ann: None,
            dirty: false,
        }
    }

    /// Reassembles an arena from persisted slots and tombstones.
    ///
    /// # Errors
    /// Returns [`RagError::IndexCorruption`] if the bitmap length disagrees with the slot count
    /// or a vector has the wrong dimension.
    pub fn from_parts(
        dimension: usize,
        ann_threshold: usize,
        slots: Vec<Slot>,
        tombstones: Vec<bool>,
    ) -> Result<Self> {
        if slots.len() != tombstones.len() {
            return Err(RagError::IndexCorruption(format!(
                "{} slots but {} tombstone flags",
                slots.len(),
                tombstones.len()
            )));
        }
        if let Some(bad) = slots.iter().find(|s| s.vector.len() != dimension) {
            return Err(RagError::IndexCorruption(format!(
                "slot {} has {} components, index dimension is {dimension}",
                bad.id,
                bad.vector.len()
            )));
        }

        let live = tombstones.iter().filter(|&&dead| !dead).count();
        let mut arena = Self {
            dimension,
            ann_threshold,
            slots,
            tombstones,
            live,
            ann: None,
            dirty: true,
        };
        arena.seal();
        Ok(arena)
    }

    /// Vector dimension.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Total slots, live and tombstoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the arena holds no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live (searchable) slots.
    #[must_use]
    pub const fn live_len(&self) -> usize {
        self.live
    }

    /// Tombstoned slots awaiting compaction.
    #[must_use]
    pub fn orphaned_len(&self) -> usize {
        self.slots.len() - self.live
    }

    /// Fails with [`RagError::DimensionMismatch`] unless `vector` fits this arena.
    ///
    /// # Errors
    /// See above.
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Appends a live slot and returns its index.
    ///
    /// # Errors
    /// Returns [`RagError::DimensionMismatch`] if `vector` has the wrong length.
    pub fn push(&mut self, id: EmbeddingId, vector: Embedding) -> Result<usize> {
        self.check_dimension(&vector)?;
        self.slots.push(Slot { id, vector });
        self.tombstones.push(false);
        self.live += 1;
        self.dirty = true;
        Ok(self.slots.len() - 1)
    }

    /// Marks a slot as deleted. Returns `false` if it was already tombstoned or out of range.
    pub fn tombstone(&mut self, slot: usize) -> bool {
        match self.tombstones.get_mut(slot) {
            Some(dead) if !*dead => {
                *dead = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if `slot` exists and is not tombstoned.
    #[must_use]
    pub fn is_live(&self, slot: usize) -> bool {
        self.tombstones.get(slot).is_some_and(|dead| !dead)
    }

    /// Returns the slot at `index`, live or not.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// All slots with their tombstone flags, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Slot, bool)> {
        self.slots.iter().zip(self.tombstones.iter().copied())
    }

    /// Live slots with their indices.
    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.tombstones[*i])
    }

    /// Brings the approximate index in line with the slots.
    ///
    /// Builds the HNSW graph when the live count is at or above the threshold and slots were
    /// appended since the last build; drops it below the threshold.
    pub fn seal(&mut self) {
        if self.live < self.ann_threshold || self.live == 0 {
            self.ann = None;
            self.dirty = false;
            return;
        }
        if !self.dirty && self.ann.is_some() {
            return;
        }

        let (points, values): (Vec<_>, Vec<_>) = self
            .iter_live()
            .map(|(i, slot)| (L2Point(slot.vector.clone()), i))
            .unzip();
        tracing::debug!(points = points.len(), "Building HNSW graph");
        self.ann = Some(Builder::default().build(points, values));
        self.dirty = false;
    }

    /// Returns up to `k` live slots closest to `query` that pass `accept`, nearest first.
    ///
    /// Ties are broken by slot index, so results are deterministic.
    ///
    /// # Errors
    /// Returns [`RagError::DimensionMismatch`] if the query has the wrong length.
    pub fn search<F>(&self, query: &[f32], k: usize, accept: F) -> Result<Vec<Neighbor>>
    where
        F: Fn(usize) -> bool + Sync,
    {
        self.check_dimension(query)?;
        if k == 0 || self.live == 0 {
            return Ok(Vec::new());
        }

        if let Some(ann) = self.ann.as_ref().filter(|_| !self.dirty) {
            let hits = self.search_ann(ann, query, k, &accept);
            let eligible = || self.iter_live().filter(|(i, _)| accept(*i)).count();
            if hits.len() == k || hits.len() >= eligible() {
                return Ok(hits);
            }
            tracing::debug!(found = hits.len(), k, "HNSW came up short, scanning");
        }

        Ok(self.search_exact(query, k, &accept))
    }

    fn search_ann<F>(
        &self,
        ann: &HnswMap<L2Point, usize>,
        query: &[f32],
        k: usize,
        accept: &F,
    ) -> Vec<Neighbor>
    where
        F: Fn(usize) -> bool + Sync,
    {
        let point = L2Point(query.to_vec());
        let mut search = Search::default();
        let mut hits: Vec<Neighbor> = ann
            .search(&point, &mut search)
            .map(|item| Neighbor {
                slot: *item.value,
                distance: item.distance,
            })
            .filter(|hit| self.is_live(hit.slot) && accept(hit.slot))
            .take(k)
            .collect();
        sort_neighbors(&mut hits);
        hits
    }

    fn search_exact<F>(&self, query: &[f32], k: usize, accept: &F) -> Vec<Neighbor>
    where
        F: Fn(usize) -> bool + Sync,
    {
        let mut hits: Vec<Neighbor> = self
            .slots
            .par_iter()
            .enumerate()
            .filter(|(i, _)| !self.tombstones[*i] && accept(*i))
            .map(|(slot, s)| Neighbor {
                slot,
                distance: l2_distance(query, &s.vector),
            })
            .collect();
        sort_neighbors(&mut hits);
        hits.truncate(k);
        hits
    }

    /// Returns a new arena holding only the live slots, in their original order.
    #[must_use]
    pub fn compacted(&self) -> Self {
        let slots: Vec<Slot> = self.iter_live().map(|(_, slot)| slot.clone()).collect();
        let mut arena = Self {
            dimension: self.dimension,
            ann_threshold: self.ann_threshold,
            live: slots.len(),
            tombstones: vec![false; slots.len()],
            slots,
            ann: None,
            dirty: true,
        };
        arena.seal();
        arena
    }
}

fn sort_neighbors(hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.slot.cmp(&b.slot))
    });
}
