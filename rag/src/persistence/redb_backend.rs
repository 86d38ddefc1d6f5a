//! redb-based embedded database persistence.

use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};
use crate::types::{Chunk, EmbeddingId};

use super::{IndexSnapshot, MetadataEntry, Persistence, decode_vectors, encode_vectors};

const VECTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");
const METADATA_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("metadata");
const BLOB_KEY: &str = "blob";

fn db_error(e: impl std::fmt::Display) -> RagError {
    RagError::Database(e.to_string())
}

/// Embedded database persistence using redb.
///
/// The vector blob and the metadata rows live in two tables of one database file and are
/// replaced in a single write transaction, so a crash leaves either the old pair or the new one.
///
/// # Example
///
/// ```rust,no_run
/// use relay_rag::persistence::{Persistence, RedbPersistence};
///
/// let persistence = RedbPersistence::new("./relay_index/index.redb").unwrap();
/// let snapshot = persistence.load().unwrap();
/// ```
pub struct RedbPersistence {
    path: PathBuf,
    db: Database,
}

impl std::fmt::Debug for RedbPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbPersistence")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbPersistence {
    /// Creates or opens a redb persistence backend.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(db_error)?;

        Ok(Self { path, db })
    }
}

impl Persistence for RedbPersistence {
    fn save(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let vectors = encode_vectors(snapshot)?;
        let rows = snapshot
            .metadata
            .iter()
            .map(|entry| {
                serde_json::to_vec(&entry.chunk)
                    .map(|json| (entry.embedding_id.as_u64(), json))
                    .map_err(|e| RagError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let write_txn = self.db.begin_write().map_err(db_error)?;
        write_txn.delete_table(METADATA_TABLE).map_err(db_error)?;
        {
            let mut table = write_txn.open_table(VECTORS_TABLE).map_err(db_error)?;
            table
                .insert(BLOB_KEY, vectors.as_slice())
                .map_err(db_error)?;

            let mut table = write_txn.open_table(METADATA_TABLE).map_err(db_error)?;
            for (id, json) in &rows {
                table.insert(*id, json.as_slice()).map_err(db_error)?;
            }
        }
        write_txn.commit().map_err(db_error)?;

        tracing::debug!(
            path = %self.path.display(),
            generation = snapshot.generation,
            slots = snapshot.slots.len(),
            "Saved index snapshot"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<IndexSnapshot>> {
        let read_txn = self.db.begin_read().map_err(db_error)?;

        let vectors = match read_txn.open_table(VECTORS_TABLE) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(db_error(e)),
        };
        let Some(blob) = vectors.get(BLOB_KEY).map_err(db_error)? else {
            return Ok(None);
        };
        let (generation, dimension, slots, tombstones) = decode_vectors(blob.value())?;

        let metadata = match read_txn.open_table(METADATA_TABLE) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(RagError::IndexCorruption(
                    "vector blob present without metadata table".into(),
                ));
            }
            Err(e) => return Err(db_error(e)),
        };

        let mut entries = Vec::new();
        for row in metadata.iter().map_err(db_error)? {
            let (id, json) = row.map_err(db_error)?;
            let chunk: Chunk = serde_json::from_slice(json.value())
                .map_err(|e| RagError::IndexCorruption(format!("unreadable metadata: {e}")))?;
            entries.push(MetadataEntry {
                embedding_id: EmbeddingId::from_u64(id.value()),
                chunk,
            });
        }

        Ok(Some(IndexSnapshot {
            generation,
            dimension,
            slots,
            tombstones,
            metadata: entries,
        }))
    }

    fn name(&self) -> &'static str {
        "redb"
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
