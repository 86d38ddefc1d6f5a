//! Vector index for RAG.
//!
//! [`VectorArena`] holds embedding slots with a tombstone bitmap and answers
//! nearest-neighbour queries by L2 distance.

mod arena;

pub use arena::{Neighbor, Slot, VectorArena};

/// Euclidean distance between two vectors of equal length.
#[must_use]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Maps an L2 distance to a similarity in `(0, 1]`: `1 / (1 + distance)`.
#[must_use]
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}
