//! Embedding store: vectors, their chunks, and durable persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use relay_core::{Embedding, EmbeddingModel};

use crate::config::{BatchFailurePolicy, EmbeddingConfig, StoreConfig};
use crate::embedding::EmbeddingGenerator;
use crate::error::{RagError, Result};
use crate::index::{Slot, VectorArena, similarity_from_distance};
use crate::persistence::{IndexSnapshot, MetadataEntry, Persistence, open_backend};
use crate::types::{Chunk, EmbeddingId, EmbeddingRecord, MetadataFilter, ScoredChunk};

/// Counters describing the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live, searchable vectors.
    pub vector_count: usize,
    /// Tombstoned vectors still occupying the arena until [`EmbeddingStore::rebuild`].
    pub orphaned_count: usize,
    /// Documents with at least one live chunk.
    pub document_count: usize,
    /// Vector dimension.
    pub dimension: usize,
    /// Number of committed writes.
    pub generation: u64,
}

/// What one [`EmbeddingStore::index`] call did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Chunks written.
    pub indexed: usize,
    /// Of those, chunks that replaced an existing embedding id.
    pub replaced: usize,
    /// Chunks dropped because their batch failed under [`BatchFailurePolicy::Skip`].
    pub skipped: usize,
    /// Indices of the batches that failed.
    pub failed_batches: Vec<usize>,
}

#[derive(Clone, Debug)]
struct Entry {
    slot: usize,
    chunk: Arc<Chunk>,
}

/// In-memory state swapped as a whole by `rebuild`.
#[derive(Debug)]
struct StoreState {
    arena: VectorArena,
    entries: HashMap<EmbeddingId, Entry>,
    /// Live chunk count per content hash.
    hashes: HashMap<u64, usize>,
    generation: u64,
}

impl StoreState {
    fn empty(dimension: usize, ann_threshold: usize) -> Self {
        Self {
            arena: VectorArena::new(dimension, ann_threshold),
            entries: HashMap::new(),
            hashes: HashMap::new(),
            generation: 0,
        }
    }

    /// Rebuilds state from a snapshot, checking that vectors and metadata pair up one to one.
    fn from_snapshot(
        snapshot: IndexSnapshot,
        dimension: usize,
        ann_threshold: usize,
    ) -> Result<Self> {
        if snapshot.dimension != dimension && !snapshot.slots.is_empty() {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: snapshot.dimension,
            });
        }

        let arena =
            VectorArena::from_parts(dimension, ann_threshold, snapshot.slots, snapshot.tombstones)?;

        let mut live_slots: HashMap<EmbeddingId, usize> = HashMap::new();
        for (slot, s) in arena.iter_live() {
            if live_slots.insert(s.id, slot).is_some() {
                return Err(RagError::IndexCorruption(format!(
                    "embedding {} has more than one live slot",
                    s.id
                )));
            }
        }

        let mut state = Self {
            arena,
            entries: HashMap::with_capacity(live_slots.len()),
            hashes: HashMap::new(),
            generation: snapshot.generation,
        };
        for MetadataEntry {
            embedding_id,
            chunk,
        } in snapshot.metadata
        {
            let Some(&slot) = live_slots.get(&embedding_id) else {
                return Err(RagError::IndexCorruption(format!(
                    "metadata references embedding {embedding_id} absent from the vector index"
                )));
            };
            if chunk.embedding_id() != embedding_id {
                return Err(RagError::IndexCorruption(format!(
                    "chunk {} stored under foreign embedding id {embedding_id}",
                    chunk.id
                )));
            }
            *state.hashes.entry(chunk.content_hash).or_default() += 1;
            if state
                .entries
                .insert(
                    embedding_id,
                    Entry {
                        slot,
                        chunk: Arc::new(chunk),
                    },
                )
                .is_some()
            {
                return Err(RagError::IndexCorruption(format!(
                    "embedding {embedding_id} has duplicate metadata"
                )));
            }
        }

        if state.entries.len() != live_slots.len() {
            return Err(RagError::IndexCorruption(format!(
                "{} live vectors but {} metadata entries",
                live_slots.len(),
                state.entries.len()
            )));
        }
        Ok(state)
    }

    fn snapshot(&self) -> IndexSnapshot {
        let (slots, tombstones) = self
            .arena
            .iter()
            .map(|(slot, dead)| (slot.clone(), dead))
            .unzip();
        let mut metadata: Vec<MetadataEntry> = self
            .entries
            .iter()
            .map(|(id, entry)| MetadataEntry {
                embedding_id: *id,
                chunk: Chunk::clone(&entry.chunk),
            })
            .collect();
        metadata.sort_by_key(|m| m.embedding_id);
        IndexSnapshot {
            generation: self.generation,
            dimension: self.arena.dimension(),
            slots,
            tombstones,
            metadata,
        }
    }

    /// The snapshot this state will produce once `removed` are deleted and `added` are
    /// appended, without touching the state itself.
    fn projected_snapshot(
        &self,
        removed: &[EmbeddingId],
        added: &[(Chunk, Embedding)],
    ) -> IndexSnapshot {
        let mut snapshot = self.snapshot();
        snapshot.generation = self.generation + 1;

        let dropped: HashSet<EmbeddingId> = removed
            .iter()
            .copied()
            .chain(added.iter().map(|(chunk, _)| chunk.embedding_id()))
            .collect();
        for id in &dropped {
            if let Some(entry) = self.entries.get(id) {
                snapshot.tombstones[entry.slot] = true;
            }
        }
        snapshot
            .metadata
            .retain(|m| !dropped.contains(&m.embedding_id));

        let mut appended: HashMap<EmbeddingId, (usize, &Chunk)> = HashMap::new();
        for (chunk, vector) in added {
            let id = chunk.embedding_id();
            if let Some((earlier, _)) = appended.insert(id, (snapshot.slots.len(), chunk)) {
                snapshot.tombstones[earlier] = true;
            }
            snapshot.slots.push(Slot {
                id,
                vector: vector.clone(),
            });
            snapshot.tombstones.push(false);
        }
        snapshot
            .metadata
            .extend(appended.into_iter().map(|(id, (_, chunk))| MetadataEntry {
                embedding_id: id,
                chunk: chunk.clone(),
            }));
        snapshot.metadata.sort_by_key(|m| m.embedding_id);
        snapshot
    }

    fn remove_entry(&mut self, id: EmbeddingId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.arena.tombstone(entry.slot);
        if let Some(count) = self.hashes.get_mut(&entry.chunk.content_hash) {
            *count -= 1;
            if *count == 0 {
                self.hashes.remove(&entry.chunk.content_hash);
            }
        }
        Some(entry)
    }

    fn live_chunks(&self) -> Vec<Arc<Chunk>> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.slot);
        entries.into_iter().map(|e| Arc::clone(&e.chunk)).collect()
    }
}

/// Vector store backed by a [`VectorArena`] and a [`Persistence`] backend.
///
/// Writers (`index`, `delete`, `rebuild`) are serialized by an async mutex held for the whole
/// operation, including embedding calls and the save. Readers take a short read lock on the
/// in-memory state, so searches run concurrently with each other and never observe a
/// half-applied write. With auto-save on, a write is saved before it is applied: a failed save
/// returns the error and leaves the in-memory state as it was.
///
/// Deleting a document removes its metadata and tombstones its vectors; tombstoned vectors are
/// never returned by [`search`](Self::search), but keep taking space (see
/// [`StoreStats::orphaned_count`]) until [`rebuild`](Self::rebuild) compacts the arena.
pub struct EmbeddingStore<M> {
    generator: EmbeddingGenerator<M>,
    config: StoreConfig,
    on_batch_failure: BatchFailurePolicy,
    persistence: Option<Box<dyn Persistence>>,
    state: RwLock<StoreState>,
    writer: async_lock::Mutex<()>,
}

impl<M> std::fmt::Debug for EmbeddingStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("EmbeddingStore")
            .field("arena", &state.arena)
            .field("entries", &state.entries.len())
            .field("generation", &state.generation)
            .field("persistence", &self.persistence.as_ref().map(|p| p.name()))
            .finish_non_exhaustive()
    }
}

impl<M: EmbeddingModel> EmbeddingStore<M> {
    /// Opens the store described by `config`, loading any persisted index.
    ///
    /// A missing index starts empty. A corrupted one (vectors and metadata out of step) is logged
    /// as an error and also starts empty.
    ///
    /// # Errors
    /// Returns [`RagError::DimensionMismatch`] if the persisted vectors do not match the model,
    /// or a storage error if the backend cannot be opened.
    pub fn open(model: Arc<M>, embedding: EmbeddingConfig, config: StoreConfig) -> Result<Self> {
        let persistence = open_backend(&config)?;
        Self::with_persistence(model, embedding, config, persistence)
    }

    /// Opens a store over a caller-provided backend.
    ///
    /// # Errors
    /// See [`open`](Self::open).
    pub fn with_persistence(
        model: Arc<M>,
        embedding: EmbeddingConfig,
        config: StoreConfig,
        persistence: Box<dyn Persistence>,
    ) -> Result<Self> {
        let dimension = model.dim();
        let loaded = persistence.load().and_then(|snapshot| {
            snapshot
                .map(|s| StoreState::from_snapshot(s, dimension, config.ann_threshold))
                .transpose()
        });

        let state = match loaded {
            Ok(Some(state)) => {
                tracing::info!(
                    backend = persistence.name(),
                    vectors = state.arena.live_len(),
                    generation = state.generation,
                    "Loaded embedding index"
                );
                state
            }
            Ok(None) => StoreState::empty(dimension, config.ann_threshold),
            Err(RagError::IndexCorruption(reason)) => {
                tracing::error!(
                    backend = persistence.name(),
                    path = %persistence.path().display(),
                    %reason,
                    "Persisted index is corrupted, starting empty"
                );
                StoreState::empty(dimension, config.ann_threshold)
            }
            Err(e) => return Err(e),
        };

        Ok(Self::from_parts(model, embedding, config, Some(persistence), state))
    }

    /// Creates a store that never touches disk.
    #[must_use]
    pub fn in_memory(model: Arc<M>, embedding: EmbeddingConfig, config: StoreConfig) -> Self {
        let state = StoreState::empty(model.dim(), config.ann_threshold);
        Self::from_parts(model, embedding, config, None, state)
    }

    fn from_parts(
        model: Arc<M>,
        embedding: EmbeddingConfig,
        config: StoreConfig,
        persistence: Option<Box<dyn Persistence>>,
        state: StoreState,
    ) -> Self {
        Self {
            on_batch_failure: embedding.on_batch_failure,
            generator: EmbeddingGenerator::new(model, embedding),
            config,
            persistence,
            state: RwLock::new(state),
            writer: async_lock::Mutex::new(()),
        }
    }

    /// The embedding generator used for documents and queries.
    #[must_use]
    pub const fn generator(&self) -> &EmbeddingGenerator<M> {
        &self.generator
    }

    /// Embeds and indexes the chunks of one document.
    ///
    /// Chunks whose deterministic embedding id is already present replace the older entry.
    ///
    /// # Errors
    /// - [`RagError::Config`] if a chunk belongs to another document
    /// - [`RagError::EmbeddingProvider`] when a batch fails under [`BatchFailurePolicy::Abort`]
    /// - [`RagError::DimensionMismatch`] if any vector has the wrong dimension; nothing is
    ///   written in that case
    pub async fn index(&self, document_id: &str, chunks: Vec<Chunk>) -> Result<IndexOutcome> {
        self.index_inner(document_id, chunks, None).await
    }

    /// Indexes chunks with caller-supplied vectors, one per chunk.
    ///
    /// # Errors
    /// As [`index`](Self::index), plus [`RagError::MalformedEmbeddings`] if the counts differ.
    pub async fn index_with_embeddings(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
        embeddings: Vec<Embedding>,
    ) -> Result<IndexOutcome> {
        if embeddings.len() != chunks.len() {
            return Err(RagError::MalformedEmbeddings {
                expected: chunks.len(),
                actual: embeddings.len(),
            });
        }
        self.index_inner(document_id, chunks, Some(embeddings)).await
    }

    async fn index_inner(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
        embeddings: Option<Vec<Embedding>>,
    ) -> Result<IndexOutcome> {
        if let Some(foreign) = chunks
            .iter()
            .find(|c| c.source_document_id != document_id)
        {
            return Err(RagError::config(format!(
                "chunk {} belongs to {}, not {document_id}",
                foreign.id, foreign.source_document_id
            )));
        }

        let _writer = self.writer.lock().await;
        if chunks.is_empty() {
            return Ok(IndexOutcome::default());
        }

        let mut outcome = IndexOutcome::default();
        let pairs: Vec<(Chunk, Embedding)> = match embeddings {
            Some(vectors) => chunks.into_iter().zip(vectors).collect(),
            None => self.embed_chunks(chunks, &mut outcome).await?,
        };

        {
            let state = self.state.read();
            for (_, vector) in &pairs {
                state.arena.check_dimension(vector)?;
            }
        }

        let snapshot = self
            .saves()
            .then(|| self.state.read().projected_snapshot(&[], &pairs));
        self.persist(snapshot)?;

        {
            let mut state = self.state.write();
            for (chunk, vector) in pairs {
                let id = chunk.embedding_id();
                if state.remove_entry(id).is_some() {
                    outcome.replaced += 1;
                }
                let slot = state.arena.push(id, vector)?;
                *state.hashes.entry(chunk.content_hash).or_default() += 1;
                state.entries.insert(
                    id,
                    Entry {
                        slot,
                        chunk: Arc::new(chunk),
                    },
                );
                outcome.indexed += 1;
            }
            state.arena.seal();
            state.generation += 1;
        }

        tracing::info!(
            document_id,
            indexed = outcome.indexed,
            replaced = outcome.replaced,
            skipped = outcome.skipped,
            "Indexed document"
        );
        Ok(outcome)
    }

    async fn embed_chunks(
        &self,
        chunks: Vec<Chunk>,
        outcome: &mut IndexOutcome,
    ) -> Result<Vec<(Chunk, Embedding)>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match self.on_batch_failure {
            BatchFailurePolicy::Abort => {
                let vectors = self.generator.generate(&texts).await?;
                Ok(chunks.into_iter().zip(vectors).collect())
            }
            BatchFailurePolicy::Skip => {
                let mut slots: Vec<Option<Embedding>> = vec![None; chunks.len()];
                for batch in self.generator.generate_batches(&texts).await {
                    match batch.result {
                        Ok(vectors) => {
                            for (slot, vector) in slots[batch.range].iter_mut().zip(vectors) {
                                *slot = Some(vector);
                            }
                        }
                        Err(error) => {
                            tracing::warn!(batch = batch.batch, %error, "Skipping failed batch");
                            outcome.skipped += batch.range.len();
                            outcome.failed_batches.push(batch.batch);
                        }
                    }
                }
                Ok(chunks
                    .into_iter()
                    .zip(slots)
                    .filter_map(|(chunk, vector)| vector.map(|v| (chunk, v)))
                    .collect())
            }
        }
    }

    /// Embeds `query` and returns up to `k` nearest live chunks with `1 / (1 + l2)` scores.
    ///
    /// An empty store returns an empty list without calling the provider.
    ///
    /// # Errors
    /// Returns the provider error if the query cannot be embedded.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.generator.embed_query(query).await?;
        self.search_vector(&vector, k, filter)
    }

    /// Nearest-neighbour search with a precomputed query vector.
    ///
    /// # Errors
    /// Returns [`RagError::DimensionMismatch`] if the vector has the wrong length.
    pub fn search_vector(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let state = self.state.read();
        let slot_chunk = |slot: usize| {
            state
                .arena
                .slot(slot)
                .and_then(|s| state.entries.get(&s.id))
                .filter(|entry| entry.slot == slot)
        };

        let hits = state.arena.search(vector, k, |slot| {
            slot_chunk(slot)
                .is_some_and(|entry| filter.is_none_or(|f| f.matches(&entry.chunk)))
        })?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                slot_chunk(hit.slot).map(|entry| ScoredChunk {
                    chunk: Arc::clone(&entry.chunk),
                    score: similarity_from_distance(hit.distance),
                })
            })
            .collect())
    }

    /// Removes every chunk of `document_id` and returns how many were removed.
    ///
    /// Metadata goes immediately and the vectors are tombstoned; the space is reclaimed by
    /// [`rebuild`](Self::rebuild).
    ///
    /// # Errors
    /// Returns a storage error if auto-save fails.
    pub async fn delete(&self, document_id: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;

        let (ids, snapshot) = {
            let state = self.state.read();
            let ids: Vec<EmbeddingId> = state
                .entries
                .iter()
                .filter(|(_, e)| e.chunk.source_document_id == document_id)
                .map(|(id, _)| *id)
                .collect();
            let snapshot = (!ids.is_empty() && self.saves())
                .then(|| state.projected_snapshot(&ids, &[]));
            (ids, snapshot)
        };
        if ids.is_empty() {
            return Ok(0);
        }
        self.persist(snapshot)?;

        {
            let mut state = self.state.write();
            for id in &ids {
                state.remove_entry(*id);
            }
            state.generation += 1;
        }
        tracing::info!(document_id, removed = ids.len(), "Deleted document");
        Ok(ids.len())
    }

    /// Compacts the arena so only live vectors remain, then swaps it in.
    ///
    /// # Errors
    /// Returns a storage error if auto-save fails.
    pub async fn rebuild(&self) -> Result<()> {
        let _writer = self.writer.lock().await;

        let rebuilt = {
            let state = self.state.read();
            let arena = state.arena.compacted();
            let slots: HashMap<EmbeddingId, usize> =
                arena.iter_live().map(|(slot, s)| (s.id, slot)).collect();
            let entries = state
                .entries
                .iter()
                .filter_map(|(id, entry)| {
                    slots.get(id).map(|&slot| {
                        (
                            *id,
                            Entry {
                                slot,
                                chunk: Arc::clone(&entry.chunk),
                            },
                        )
                    })
                })
                .collect();
            StoreState {
                arena,
                entries,
                hashes: state.hashes.clone(),
                generation: state.generation + 1,
            }
        };

        self.persist(self.saves().then(|| rebuilt.snapshot()))?;

        let reclaimed = {
            let mut state = self.state.write();
            let reclaimed = state.arena.orphaned_len();
            *state = rebuilt;
            reclaimed
        };
        tracing::info!(reclaimed, "Rebuilt vector index");
        Ok(())
    }

    /// Writes the current state to the backend regardless of `auto_save`.
    ///
    /// # Errors
    /// Returns a storage error if the save fails.
    pub async fn save(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let snapshot = self.state.read().snapshot();
        self.persist(Some(snapshot))
    }

    /// Whether writes are saved before they are applied.
    const fn saves(&self) -> bool {
        self.config.auto_save && self.persistence.is_some()
    }

    fn persist(&self, snapshot: Option<IndexSnapshot>) -> Result<()> {
        match (&self.persistence, snapshot) {
            (Some(persistence), Some(snapshot)) => persistence.save(&snapshot),
            _ => Ok(()),
        }
    }

    /// Store counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        let mut documents: Vec<&str> = state
            .entries
            .values()
            .map(|e| e.chunk.source_document_id.as_str())
            .collect();
        documents.sort_unstable();
        documents.dedup();
        StoreStats {
            vector_count: state.arena.live_len(),
            orphaned_count: state.arena.orphaned_len(),
            document_count: documents.len(),
            dimension: state.arena.dimension(),
            generation: state.generation,
        }
    }

    /// Number of live vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().arena.live_len()
    }

    /// Returns `true` if no live vectors exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a live chunk has this content hash.
    #[must_use]
    pub fn contains_hash(&self, hash: u64) -> bool {
        self.state.read().hashes.contains_key(&hash)
    }

    /// Content hashes of all live chunks.
    #[must_use]
    pub fn content_hashes(&self) -> Vec<u64> {
        self.state.read().hashes.keys().copied().collect()
    }

    /// All live chunks in arena order. The `Arc`s are shared with the store.
    #[must_use]
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.state.read().live_chunks()
    }

    /// Live embedding records in arena order.
    #[must_use]
    pub fn records(&self) -> Vec<EmbeddingRecord> {
        let state = self.state.read();
        state
            .arena
            .iter_live()
            .filter_map(|(_, slot)| {
                state.entries.get(&slot.id).map(|entry| EmbeddingRecord {
                    embedding_id: slot.id,
                    chunk_id: entry.chunk.id.clone(),
                    vector: slot.vector.clone(),
                    document_id: entry.chunk.source_document_id.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::persistence::FilePersistence;
    use crate::testing::{HashEmbedder, MemoryPersistence};
    use crate::types::Metadata;
    use std::time::Duration;
    use tempfile::tempdir;

    fn embedding_config() -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size: 2,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
            inter_batch_delay: Duration::ZERO,
            ..EmbeddingConfig::default()
        }
    }

    fn store_config(dir: &std::path::Path) -> StoreConfig {
        StoreConfig {
            index_dir: dir.to_path_buf(),
            ..StoreConfig::default()
        }
    }

    fn chunks(document_id: &str, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| Chunk::new(document_id, i, *text, 1, Metadata::new()))
            .collect()
    }

    fn memory_store(dimension: usize) -> EmbeddingStore<HashEmbedder> {
        EmbeddingStore::in_memory(
            Arc::new(HashEmbedder::new(dimension)),
            embedding_config(),
            StoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_store_search_returns_nothing() {
        let model = HashEmbedder::new(8);
        let store = EmbeddingStore::in_memory(
            Arc::new(model.clone()),
            embedding_config(),
            StoreConfig::default(),
        );

        assert!(store.search("anything", 5, None).await.unwrap().is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn index_and_search() {
        let store = memory_store(32);
        let outcome = store
            .index(
                "doc1",
                chunks("doc1", &["reset your password", "billing happens monthly"]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.indexed, 2);

        let results = store.search("password reset", 1, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.text, "reset your password");
        assert!(results[0].score > 0.0 && results[0].score <= 1.0);
    }

    #[tokio::test]
    async fn reindexing_replaces_by_embedding_id() {
        let store = memory_store(16);
        store.index("doc1", chunks("doc1", &["old text"])).await.unwrap();
        let outcome = store.index("doc1", chunks("doc1", &["new text"])).await.unwrap();

        assert_eq!(outcome.replaced, 1);
        let stats = store.stats();
        assert_eq!(stats.vector_count, 1);
        assert_eq!(stats.orphaned_count, 1);
        assert_eq!(store.chunks()[0].text, "new text");
    }

    #[tokio::test]
    async fn dimension_mismatch_leaves_index_unchanged() {
        let store = memory_store(4);
        store.index("doc1", chunks("doc1", &["kept"])).await.unwrap();
        let before = store.stats();

        let err = store
            .index_with_embeddings("doc2", chunks("doc2", &["bad"]), vec![vec![0.0; 3]])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(store.stats(), before);
    }

    #[tokio::test]
    async fn rejects_chunks_of_other_documents() {
        let store = memory_store(4);
        let err = store.index("doc1", chunks("doc2", &["x"])).await.unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn delete_then_rebuild() {
        let store = memory_store(16);
        store.index("doc1", chunks("doc1", &["alpha", "beta"])).await.unwrap();
        store.index("doc2", chunks("doc2", &["gamma"])).await.unwrap();

        assert_eq!(store.delete("doc1").await.unwrap(), 2);
        assert_eq!(store.delete("doc1").await.unwrap(), 0);

        let results = store.search("alpha", 5, None).await.unwrap();
        assert!(results.iter().all(|r| r.chunk.source_document_id != "doc1"));

        let stats = store.stats();
        assert_eq!(stats.vector_count, 1);
        assert_eq!(stats.orphaned_count, 2);
        assert_eq!(stats.document_count, 1);

        store.rebuild().await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.vector_count, 1);
        assert_eq!(stats.orphaned_count, 0);
        assert_eq!(store.search("gamma", 5, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filter_restricts_results() {
        let store = memory_store(16);
        store.index("doc1", chunks("doc1", &["shared words"])).await.unwrap();
        store.index("doc2", chunks("doc2", &["shared words too"])).await.unwrap();

        let filter = MetadataFilter::new().require(MetadataFilter::DOCUMENT_ID, "doc2");
        let results = store.search("shared words", 5, Some(&filter)).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source_document_id, "doc2");
    }

    #[tokio::test]
    async fn skip_policy_drops_failed_batches() {
        let model = HashEmbedder::new(8);
        let mut config = embedding_config();
        config.on_batch_failure = BatchFailurePolicy::Skip;
        config.retry = RetryConfig::none();
        let store = EmbeddingStore::in_memory(Arc::new(model.clone()), config, StoreConfig::default());

        model.set_failing(true);
        let outcome = store.index("doc1", chunks("doc1", &["a", "b", "c"])).await.unwrap();

        assert_eq!(outcome.indexed, 0);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(outcome.failed_batches, vec![0, 1]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn abort_policy_surfaces_provider_error() {
        let model = HashEmbedder::new(8);
        let store = EmbeddingStore::in_memory(
            Arc::new(model.clone()),
            embedding_config(),
            StoreConfig::default(),
        );

        model.set_failing(true);
        let err = store.index("doc1", chunks("doc1", &["a"])).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingProvider { attempts: 3, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let model = Arc::new(HashEmbedder::new(8));
        {
            let store =
                EmbeddingStore::open(Arc::clone(&model), embedding_config(), store_config(dir.path()))
                    .unwrap();
            store.index("doc1", chunks("doc1", &["one", "two"])).await.unwrap();
            store.index("doc2", chunks("doc2", &["three"])).await.unwrap();
            store.delete("doc2").await.unwrap();
        }

        let store =
            EmbeddingStore::open(model, embedding_config(), store_config(dir.path())).unwrap();
        let stats = store.stats();
        assert_eq!(stats.vector_count, 2);
        assert_eq!(stats.orphaned_count, 1);
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.generation, 3);
        assert!(store.contains_hash(crate::dedup::content_hash("one")));
        let results = store.search("two", 2, None).await.unwrap();
        assert!(results.iter().any(|r| r.chunk.text == "two"));
    }

    #[tokio::test]
    async fn redb_backend_persists() {
        let dir = tempdir().unwrap();
        let model = Arc::new(HashEmbedder::new(8));
        let config = StoreConfig {
            backend: crate::config::PersistenceBackend::Redb,
            ..store_config(dir.path())
        };
        {
            let store =
                EmbeddingStore::open(Arc::clone(&model), embedding_config(), config.clone())
                    .unwrap();
            store.index("doc1", chunks("doc1", &["one"])).await.unwrap();
        }
        let store = EmbeddingStore::open(model, embedding_config(), config).unwrap();
        assert_eq!(store.len(), 1);
    }

    fn store_over(
        persistence: &MemoryPersistence,
        dimension: usize,
    ) -> EmbeddingStore<HashEmbedder> {
        EmbeddingStore::with_persistence(
            Arc::new(HashEmbedder::new(dimension)),
            embedding_config(),
            StoreConfig::default(),
            Box::new(persistence.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failed_save_leaves_state_untouched() {
        let persistence = MemoryPersistence::default();
        let store = store_over(&persistence, 16);
        store.index("keep", chunks("keep", &["keep this"])).await.unwrap();
        store.index("gone", chunks("gone", &["drop this"])).await.unwrap();
        let before = store.stats();

        persistence.set_failing(true);
        assert!(store.index("new", chunks("new", &["never lands"])).await.is_err());
        assert!(store.delete("gone").await.is_err());
        assert_eq!(store.stats(), before);
        assert_eq!(store.records().len(), 2);
        assert!(!store.contains_hash(crate::dedup::content_hash("never lands")));

        persistence.set_failing(false);
        assert_eq!(store.delete("gone").await.unwrap(), 1);
        let after_delete = store.stats();

        persistence.set_failing(true);
        assert!(store.rebuild().await.is_err());
        assert_eq!(store.stats(), after_delete);
        assert_eq!(store.stats().orphaned_count, 1);
    }

    #[tokio::test]
    async fn saved_snapshot_matches_applied_state() {
        let persistence = MemoryPersistence::default();
        let store = store_over(&persistence, 8);
        let model = HashEmbedder::new(8);

        store
            .index("doc1", chunks("doc1", &["one", "two"]))
            .await
            .unwrap();
        store
            .index_with_embeddings(
                "doc1",
                vec![
                    Chunk::new("doc1", 0, "first draft", 1, Metadata::new()),
                    Chunk::new("doc1", 0, "second draft", 1, Metadata::new()),
                ],
                vec![model.vector("first draft"), model.vector("second draft")],
            )
            .await
            .unwrap();
        assert_eq!(persistence.saved(), Some(store.state.read().snapshot()));

        store.index("doc2", chunks("doc2", &["three"])).await.unwrap();
        store.delete("doc1").await.unwrap();
        assert_eq!(persistence.saved(), Some(store.state.read().snapshot()));

        store.rebuild().await.unwrap();
        let saved = persistence.saved().unwrap();
        assert_eq!(saved, store.state.read().snapshot());
        assert_eq!(saved.generation, store.stats().generation);
    }

    #[tokio::test]
    async fn corrupted_index_starts_empty() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path());
        let chunk = Chunk::new("doc1", 0, "orphan", 1, Metadata::new());
        persistence
            .save(&IndexSnapshot {
                generation: 1,
                dimension: 4,
                slots: Vec::new(),
                tombstones: Vec::new(),
                metadata: vec![MetadataEntry {
                    embedding_id: chunk.embedding_id(),
                    chunk,
                }],
            })
            .unwrap();

        let store = EmbeddingStore::open(
            Arc::new(HashEmbedder::new(4)),
            embedding_config(),
            store_config(dir.path()),
        )
        .unwrap();
        assert!(store.is_empty());
        assert_eq!(store.stats().generation, 0);
    }

    #[tokio::test]
    async fn reload_with_other_dimension_fails() {
        let dir = tempdir().unwrap();
        {
            let store = EmbeddingStore::open(
                Arc::new(HashEmbedder::new(8)),
                embedding_config(),
                store_config(dir.path()),
            )
            .unwrap();
            store.index("doc1", chunks("doc1", &["one"])).await.unwrap();
        }

        let err = EmbeddingStore::open(
            Arc::new(HashEmbedder::new(4)),
            embedding_config(),
            store_config(dir.path()),
        )
        .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn records_expose_live_vectors() {
        let store = memory_store(8);
        store.index("doc1", chunks("doc1", &["one", "two"])).await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chunk_id, "doc1#chunk_0");
        assert_eq!(records[0].embedding_id, EmbeddingId::derive("doc1", 0));
        assert_eq!(records[0].vector.len(), 8);
    }
}
