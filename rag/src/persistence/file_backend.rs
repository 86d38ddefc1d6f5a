//! rkyv vector blob plus JSON metadata side-file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

use super::{IndexSnapshot, MetadataEntry, Persistence, decode_vectors, encode_vectors};

const CURRENT: &str = "CURRENT";
const VECTORS_PREFIX: &str = "vectors-";
const METADATA_PREFIX: &str = "metadata-";

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    generation: u64,
    entries: Vec<MetadataEntry>,
}

/// Stores each snapshot as a pair of generation-stamped files in one directory.
///
/// Layout:
/// - `vectors-<generation>.rkyv`: slots and tombstones, archived with rkyv
/// - `metadata-<generation>.json`: the chunk behind each live embedding id
/// - `CURRENT`: the generation of the last complete pair
///
/// A save writes and fsyncs both files of the new generation, then swaps `CURRENT` by
/// write-temp-then-rename. A crash before the rename leaves the previous pair in charge, so the
/// two artifacts can never be observed out of step. A missing `CURRENT` means an empty store.
///
/// # Example
///
/// ```rust,no_run
/// use relay_rag::persistence::{FilePersistence, Persistence};
///
/// let persistence = FilePersistence::new("./relay_index");
/// let snapshot = persistence.load().unwrap();
/// assert!(snapshot.is_none());
/// ```
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Creates a backend rooted at `dir`. Nothing is touched until the first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn vectors_path(&self, generation: u64) -> PathBuf {
        self.dir
            .join(format!("{VECTORS_PREFIX}{generation:020}.rkyv"))
    }

    fn metadata_path(&self, generation: u64) -> PathBuf {
        self.dir
            .join(format!("{METADATA_PREFIX}{generation:020}.json"))
    }

    fn persistence_error(path: &Path) -> impl FnOnce(std::io::Error) -> RagError + '_ {
        move |source| RagError::Persistence {
            path: path.to_path_buf(),
            source,
        }
    }

    fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = File::create(path).map_err(Self::persistence_error(path))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(Self::persistence_error(path))
    }

    fn read_current(&self) -> Result<Option<u64>> {
        let path = self.dir.join(CURRENT);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::persistence_error(&path)(e)),
        };
        text.trim()
            .parse()
            .map(Some)
            .map_err(|_| RagError::IndexCorruption(format!("unreadable {}", path.display())))
    }

    fn read_artifact(path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RagError::IndexCorruption(format!("{} is missing", path.display()))
            } else {
                Self::persistence_error(path)(e)
            }
        })
    }

    /// Removes artifacts of every generation other than `keep`.
    fn remove_stale(&self, keep: u64) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let keep_vectors = self.vectors_path(keep);
        let keep_metadata = self.metadata_path(keep);
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stale = (name.starts_with(VECTORS_PREFIX) && path != keep_vectors)
                || (name.starts_with(METADATA_PREFIX) && path != keep_metadata);
            if stale && let Err(error) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), %error, "Could not remove stale artifact");
            }
        }
    }
}

impl Persistence for FilePersistence {
    fn save(&self, snapshot: &IndexSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(Self::persistence_error(&self.dir))?;

        let vectors = encode_vectors(snapshot)?;
        Self::write_synced(&self.vectors_path(snapshot.generation), &vectors)?;

        let metadata = serde_json::to_vec(&MetadataFile {
            generation: snapshot.generation,
            entries: snapshot.metadata.clone(),
        })
        .map_err(|e| RagError::Serialization(e.to_string()))?;
        Self::write_synced(&self.metadata_path(snapshot.generation), &metadata)?;

        let tmp = self.dir.join(format!("{CURRENT}.tmp"));
        let current = self.dir.join(CURRENT);
        Self::write_synced(&tmp, snapshot.generation.to_string().as_bytes())?;
        fs::rename(&tmp, &current).map_err(Self::persistence_error(&current))?;
        #[cfg(unix)]
        {
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
        }

        self.remove_stale(snapshot.generation);
        tracing::debug!(
            dir = %self.dir.display(),
            generation = snapshot.generation,
            slots = snapshot.slots.len(),
            "Saved index snapshot"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<IndexSnapshot>> {
        let Some(generation) = self.read_current()? else {
            return Ok(None);
        };

        let vectors = Self::read_artifact(&self.vectors_path(generation))?;
        let (vector_generation, dimension, slots, tombstones) = decode_vectors(&vectors)?;

        let metadata = Self::read_artifact(&self.metadata_path(generation))?;
        let metadata: MetadataFile = serde_json::from_slice(&metadata)
            .map_err(|e| RagError::IndexCorruption(format!("unreadable metadata: {e}")))?;

        if vector_generation != generation || metadata.generation != generation {
            return Err(RagError::IndexCorruption(format!(
                "generation mismatch: CURRENT={generation}, vectors={vector_generation}, \
                 metadata={}",
                metadata.generation
            )));
        }

        Ok(Some(IndexSnapshot {
            generation,
            dimension,
            slots,
            tombstones,
            metadata: metadata.entries,
        }))
    }

    fn name(&self) -> &'static str {
        "files"
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::sample_snapshot;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path().join("index"));

        let snapshot = sample_snapshot(1);
        persistence.save(&snapshot).unwrap();

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn load_nonexistent() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path().join("missing"));
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn newer_generation_replaces_older() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path());

        persistence.save(&sample_snapshot(1)).unwrap();
        persistence.save(&sample_snapshot(2)).unwrap();

        assert_eq!(persistence.load().unwrap().unwrap().generation, 2);
        assert!(!persistence.vectors_path(1).exists());
        assert!(!persistence.metadata_path(1).exists());
    }

    #[test]
    fn interrupted_save_keeps_previous_pair() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path());
        persistence.save(&sample_snapshot(1)).unwrap();

        // A crash after writing the next vector blob but before CURRENT moves.
        fs::write(persistence.vectors_path(2), b"partial").unwrap();

        assert_eq!(persistence.load().unwrap().unwrap().generation, 1);
    }

    #[test]
    fn missing_half_is_corruption() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path());
        persistence.save(&sample_snapshot(3)).unwrap();
        fs::remove_file(persistence.metadata_path(3)).unwrap();

        assert!(matches!(
            persistence.load(),
            Err(RagError::IndexCorruption(_))
        ));
    }

    #[test]
    fn mismatched_stamp_is_corruption() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path());
        persistence.save(&sample_snapshot(4)).unwrap();
        let stale = serde_json::to_vec(&MetadataFile {
            generation: 3,
            entries: Vec::new(),
        })
        .unwrap();
        fs::write(persistence.metadata_path(4), stale).unwrap();

        assert!(matches!(
            persistence.load(),
            Err(RagError::IndexCorruption(_))
        ));
    }
}
