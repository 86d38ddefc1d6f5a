//! Persistence backends for the embedding store.
//!
//! The store persists two artifacts that must always be loaded together: the vector blob (slots
//! and tombstones) and the metadata side-file (the chunk behind every live embedding id). The
//! [`Persistence`] trait saves and loads them as one [`IndexSnapshot`], and every backend commits
//! the pair atomically.

mod file_backend;
mod redb_backend;

pub use file_backend::FilePersistence;
pub use redb_backend::RedbPersistence;

use std::path::Path;

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use serde::{Deserialize, Serialize};

use crate::config::{PersistenceBackend, StoreConfig};
use crate::error::{RagError, Result};
use crate::index::Slot;
use crate::types::{Chunk, EmbeddingId};

/// Metadata side-file entry: the chunk stored under an embedding id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Key shared with the vector slot.
    pub embedding_id: EmbeddingId,
    /// The chunk, including its text and metadata.
    pub chunk: Chunk,
}

/// Everything the store persists, as one unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexSnapshot {
    /// Monotonic save counter, stamped on both artifacts.
    pub generation: u64,
    /// Vector dimension.
    pub dimension: usize,
    /// Vector slots in arena order.
    pub slots: Vec<Slot>,
    /// Tombstone flag per slot.
    pub tombstones: Vec<bool>,
    /// Metadata for every live embedding id.
    pub metadata: Vec<MetadataEntry>,
}

/// Trait for persistence backends.
pub trait Persistence: Send + Sync {
    /// Saves the snapshot, replacing whatever was stored before.
    ///
    /// Either both artifacts of the new snapshot become visible or neither does.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be written.
    fn save(&self, snapshot: &IndexSnapshot) -> Result<()>;

    /// Loads the last saved snapshot.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet.
    ///
    /// # Errors
    /// Returns [`RagError::IndexCorruption`] if the two artifacts do not belong together, and
    /// storage errors otherwise.
    fn load(&self) -> Result<Option<IndexSnapshot>>;

    /// Returns the backend name.
    fn name(&self) -> &'static str;

    /// Returns the storage location.
    fn path(&self) -> &Path;
}

/// Opens the backend selected in `config`.
///
/// # Errors
/// Returns an error if the storage location cannot be prepared.
pub fn open_backend(config: &StoreConfig) -> Result<Box<dyn Persistence>> {
    Ok(match config.backend {
        PersistenceBackend::Files => Box::new(FilePersistence::new(&config.index_dir)),
        PersistenceBackend::Redb => {
            Box::new(RedbPersistence::new(config.index_dir.join("index.redb"))?)
        }
    })
}

/// Archived form of the vector artifact.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct VectorBlob {
    generation: u64,
    dimension: u32,
    ids: Vec<u64>,
    tombstones: Vec<bool>,
    /// Row-major, `ids.len() * dimension` values.
    values: Vec<f32>,
}

fn encode_vectors(snapshot: &IndexSnapshot) -> Result<AlignedVec> {
    let dimension = u32::try_from(snapshot.dimension)
        .map_err(|_| RagError::Serialization("dimension does not fit in u32".into()))?;
    let blob = VectorBlob {
        generation: snapshot.generation,
        dimension,
        ids: snapshot.slots.iter().map(|s| s.id.as_u64()).collect(),
        tombstones: snapshot.tombstones.clone(),
        values: snapshot
            .slots
            .iter()
            .flat_map(|s| s.vector.iter().copied())
            .collect(),
    };
    rkyv::to_bytes::<RkyvError>(&blob).map_err(|e| RagError::Serialization(e.to_string()))
}

/// Decodes the vector artifact into `(generation, dimension, slots, tombstones)`.
fn decode_vectors(bytes: &[u8]) -> Result<(u64, usize, Vec<Slot>, Vec<bool>)> {
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let blob = rkyv::from_bytes::<VectorBlob, RkyvError>(&aligned)
        .map_err(|e| RagError::IndexCorruption(format!("unreadable vector blob: {e}")))?;

    let dimension = blob.dimension as usize;
    if blob.values.len() != blob.ids.len() * dimension {
        return Err(RagError::IndexCorruption(format!(
            "vector blob holds {} values for {} slots of dimension {dimension}",
            blob.values.len(),
            blob.ids.len()
        )));
    }

    let slots = if dimension == 0 {
        blob.ids
            .iter()
            .map(|&id| Slot {
                id: EmbeddingId::from_u64(id),
                vector: Vec::new(),
            })
            .collect()
    } else {
        blob.ids
            .iter()
            .zip(blob.values.chunks_exact(dimension))
            .map(|(&id, vector)| Slot {
                id: EmbeddingId::from_u64(id),
                vector: vector.to_vec(),
            })
            .collect()
    };
    Ok((blob.generation, dimension, slots, blob.tombstones))
}
