//! High-level knowledge base: ingest, retrieve, and score in one place.

use std::fmt::{self, Write as _};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_core::EmbeddingModel;
use serde::Serialize;

use crate::chunking::{ApproxTokenCounter, Chunker, TokenCounter, build_chunker};
use crate::cleaning::{BasicCleaner, Cleaner};
use crate::config::RagConfig;
use crate::confidence::{ConfidenceResult, ConfidenceScorer};
use crate::dedup::Deduplicator;
use crate::error::Result;
use crate::ingest::{IngestProgress, IngestStage, collect_text_files, document_id_for};
use crate::lexical::LexicalIndex;
use crate::persistence::Persistence;
use crate::retrieval::HybridRetriever;
use crate::store::{EmbeddingStore, StoreStats};
use crate::types::{IngestDocument, MetadataFilter, RetrievedChunk};

/// What [`KnowledgeBase::ingest`] did with one document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// The ingested document.
    pub document_id: String,
    /// Chunks produced by the chunker.
    pub chunks: usize,
    /// Chunks dropped because identical content was already indexed.
    pub duplicates: usize,
    /// Chunks written to the index.
    pub indexed: usize,
    /// Of those, chunks that replaced an existing entry.
    pub replaced: usize,
    /// Chunks left out because their embedding batch failed.
    pub skipped: usize,
}

/// Retrieved chunks for a query plus a prompt-ready rendering of them.
#[derive(Clone, Debug, Serialize)]
pub struct AnswerContext {
    /// The query.
    pub query: String,
    /// Ranked chunks.
    pub retrieved: Vec<RetrievedChunk>,
    /// Chunk texts, each preceded by a `[source: <chunk id>]` line.
    pub context: String,
}

impl AnswerContext {
    /// Returns `true` if nothing relevant was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.retrieved.is_empty()
    }
}

/// Document ingestion, hybrid retrieval, and confidence scoring over one index.
///
/// Writes (`ingest`, `delete_document`, `rebuild`) run one at a time; each one refreshes the BM25
/// index from the store's live chunks before releasing the writer lock. Retrieval runs
/// concurrently with everything.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relay_rag::{IngestDocument, KnowledgeBase, RagConfig};
/// # async fn demo(model: impl relay_core::EmbeddingModel) -> relay_rag::Result<()> {
/// let kb = KnowledgeBase::open(Arc::new(model), RagConfig::default())?;
///
/// kb.ingest(IngestDocument::new("faq", "Refunds are issued within 5 days.")).await?;
///
/// let ctx = kb.answer_context("how long do refunds take?", None).await;
/// let answer = "According to the FAQ, refunds take 5 days. [source: faq#chunk_0]";
/// let confidence = kb.score(answer, &ctx.retrieved, &ctx.query);
/// if confidence.should_escalate {
///     // hand off to a human
/// }
/// # Ok(())
/// # }
/// ```
pub struct KnowledgeBase<M> {
    store: EmbeddingStore<M>,
    lexical: RwLock<Arc<LexicalIndex>>,
    chunker: Box<dyn Chunker>,
    cleaner: Box<dyn Cleaner>,
    scorer: ConfidenceScorer,
    config: RagConfig,
    writer: async_lock::Mutex<()>,
}

impl<M> fmt::Debug for KnowledgeBase<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("store", &self.store)
            .field("lexical", &self.lexical.read().len())
            .field("chunker", &self.chunker.name())
            .field("cleaner", &self.cleaner.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M: EmbeddingModel> KnowledgeBase<M> {
    /// Opens a knowledge base with persisted storage under `config.store.index_dir`.
    ///
    /// # Errors
    /// Returns [`RagError::Config`](crate::RagError::Config) for invalid settings, or a storage
    /// error if the persisted index cannot be opened.
    pub fn open(model: Arc<M>, config: RagConfig) -> Result<Self> {
        Self::builder(model).config(config).build()
    }

    /// Creates a knowledge base that never touches disk.
    ///
    /// # Errors
    /// Returns [`RagError::Config`](crate::RagError::Config) for invalid settings.
    pub fn in_memory(model: Arc<M>, config: RagConfig) -> Result<Self> {
        Self::builder(model).config(config).in_memory().build()
    }

    /// Creates a builder.
    #[must_use]
    pub fn builder(model: Arc<M>) -> KnowledgeBaseBuilder<M> {
        KnowledgeBaseBuilder::new(model)
    }

    /// Cleans, chunks, deduplicates, embeds and indexes one document.
    ///
    /// With deduplication on, chunks whose content is already live in the index are dropped, so
    /// ingesting an unchanged document a second time writes nothing. To replace a document whose
    /// content changed, delete it first.
    ///
    /// # Errors
    /// Returns chunking, embedding, dimension or storage errors. Nothing is indexed on error.
    #[tracing::instrument(skip_all, fields(document_id = %document.document_id))]
    pub async fn ingest(&self, document: IngestDocument) -> Result<IngestReport> {
        let cleaned = self.cleaner.clean(&document);
        let chunks = self.chunker.chunk(&cleaned)?;
        let produced = chunks.len();

        let _writer = self.writer.lock().await;
        let (chunks, duplicates) = if self.config.deduplication {
            let outcome = Deduplicator::with_known(self.store.content_hashes()).filter(chunks);
            let dropped = outcome.dropped();
            (outcome.chunks, dropped)
        } else {
            (chunks, 0)
        };

        let outcome = self.store.index(&document.document_id, chunks).await?;
        if outcome.indexed > 0 {
            self.refresh_lexical();
        }

        Ok(IngestReport {
            document_id: document.document_id,
            chunks: produced,
            duplicates,
            indexed: outcome.indexed,
            replaced: outcome.replaced,
            skipped: outcome.skipped,
        })
    }

    /// Ingests every `.txt` / `.md` file under `dir`. Document ids are paths relative to `dir`.
    ///
    /// Files that cannot be read are reported as skipped. Returns the number of files ingested.
    ///
    /// # Errors
    /// Returns an error if `dir` cannot be read or ingesting a file fails.
    pub async fn ingest_directory(&self, dir: impl AsRef<Path>) -> Result<usize> {
        self.ingest_directory_with_progress(dir, |_| {}).await
    }

    /// [`ingest_directory`](Self::ingest_directory) with a progress callback.
    ///
    /// # Errors
    /// See [`ingest_directory`](Self::ingest_directory).
    pub async fn ingest_directory_with_progress<F>(
        &self,
        dir: impl AsRef<Path>,
        mut on_progress: F,
    ) -> Result<usize>
    where
        F: FnMut(IngestProgress),
    {
        let root = dir.as_ref();
        on_progress(IngestProgress::new(0, 0, None, IngestStage::Scanning));

        let files = collect_text_files(root)?;
        let total = files.len();
        let mut ingested = 0;

        for (idx, path) in files.into_iter().enumerate() {
            on_progress(IngestProgress::new(
                idx,
                total,
                Some(path.clone()),
                IngestStage::Ingesting,
            ));

            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    on_progress(IngestProgress::new(
                        idx + 1,
                        total,
                        Some(path),
                        IngestStage::Skipped {
                            reason: e.to_string(),
                        },
                    ));
                    continue;
                }
            };

            let mut document = IngestDocument::new(document_id_for(root, &path), text)
                .with("path", path.display().to_string());
            if let Some(name) = path.file_name() {
                document = document.with("filename", name.to_string_lossy().into_owned());
            }
            if let Some(ext) = path.extension() {
                document = document.with("file_type", ext.to_string_lossy().to_lowercase());
            }

            let report = self.ingest(document).await?;
            ingested += 1;
            on_progress(IngestProgress::new(
                idx + 1,
                total,
                Some(path),
                IngestStage::Ingested {
                    indexed: report.indexed,
                    duplicates: report.duplicates,
                },
            ));
        }

        on_progress(IngestProgress::new(total, total, None, IngestStage::Done));
        Ok(ingested)
    }

    /// Removes a document. Its chunks stop appearing in results immediately; vector storage is
    /// reclaimed by [`rebuild`](Self::rebuild).
    ///
    /// # Errors
    /// Returns a storage error if saving fails.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let removed = self.store.delete(document_id).await?;
        if removed > 0 {
            self.refresh_lexical();
        }
        Ok(removed)
    }

    /// Compacts the vector index, purging every deleted vector for good.
    ///
    /// # Errors
    /// Returns a storage error if saving fails.
    pub async fn rebuild(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.store.rebuild().await?;
        self.refresh_lexical();
        Ok(())
    }

    /// Persists the index now, regardless of `auto_save`.
    ///
    /// # Errors
    /// Returns a storage error if saving fails.
    pub async fn save(&self) -> Result<()> {
        self.store.save().await
    }

    fn refresh_lexical(&self) {
        let index = LexicalIndex::build(self.store.chunks());
        *self.lexical.write() = Arc::new(index);
    }

    fn retriever(&self) -> HybridRetriever<&EmbeddingStore<M>, Arc<LexicalIndex>> {
        let lexical = Arc::clone(&self.lexical.read());
        HybridRetriever::new(&self.store, lexical, self.config.retrieval.clone())
    }

    /// Retrieves with the configured `default_top_k` and `alpha`.
    pub async fn retrieve(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RetrievedChunk> {
        self.retriever().retrieve_default(query, filter).await
    }

    /// Retrieves with explicit `k` and `alpha`. See [`HybridRetriever::retrieve`].
    pub async fn retrieve_with(
        &self,
        query: &str,
        k: usize,
        alpha: f32,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RetrievedChunk> {
        self.retriever().retrieve(query, k, alpha, filter).await
    }

    /// Retrieves for `query` and renders the chunks for an answer-generation prompt.
    pub async fn answer_context(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
    ) -> AnswerContext {
        let retrieved = self.retrieve(query, filter).await;
        let mut context = String::new();
        for hit in &retrieved {
            let _ = writeln!(context, "[source: {}]\n{}\n", hit.chunk.id, hit.chunk.text);
        }
        AnswerContext {
            query: query.to_string(),
            retrieved,
            context: context.trim_end().to_string(),
        }
    }

    /// Scores a generated answer. See [`ConfidenceScorer::score`].
    #[must_use]
    pub fn score(&self, answer: &str, retrieved: &[RetrievedChunk], query: &str) -> ConfidenceResult {
        self.scorer.score(answer, retrieved, query)
    }

    /// Store counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// The underlying embedding store.
    #[must_use]
    pub const fn store(&self) -> &EmbeddingStore<M> {
        &self.store
    }

    /// The current BM25 index.
    #[must_use]
    pub fn lexical(&self) -> Arc<LexicalIndex> {
        Arc::clone(&self.lexical.read())
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &RagConfig {
        &self.config
    }
}

/// Builder for [`KnowledgeBase`].
pub struct KnowledgeBaseBuilder<M> {
    model: Arc<M>,
    config: RagConfig,
    cleaner: Box<dyn Cleaner>,
    counter: Arc<dyn TokenCounter>,
    persistence: Option<Box<dyn Persistence>>,
    in_memory: bool,
}

impl<M> fmt::Debug for KnowledgeBaseBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBaseBuilder")
            .field("config", &self.config)
            .field("cleaner", &self.cleaner.name())
            .field("counter", &self.counter.name())
            .field("in_memory", &self.in_memory)
            .finish_non_exhaustive()
    }
}

impl<M: EmbeddingModel> KnowledgeBaseBuilder<M> {
    fn new(model: Arc<M>) -> Self {
        Self {
            model,
            config: RagConfig::default(),
            cleaner: Box::new(BasicCleaner),
            counter: Arc::new(ApproxTokenCounter),
            persistence: None,
            in_memory: false,
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a custom cleaner.
    #[must_use]
    pub fn cleaner(mut self, cleaner: impl Cleaner + 'static) -> Self {
        self.cleaner = Box::new(cleaner);
        self
    }

    /// Uses a custom token counter for chunk sizing.
    #[must_use]
    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Uses a custom persistence backend instead of the configured one.
    #[must_use]
    pub fn persistence(mut self, persistence: Box<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Keeps everything in memory.
    #[must_use]
    pub const fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    /// Builds the knowledge base, loading any persisted index.
    ///
    /// # Errors
    /// See [`KnowledgeBase::open`].
    pub fn build(self) -> Result<KnowledgeBase<M>> {
        self.config.validate()?;
        let chunker = build_chunker(&self.config.chunking, self.counter)?;

        let embedding = self.config.embedding.clone();
        let store_config = self.config.store.clone();
        let store = if self.in_memory {
            EmbeddingStore::in_memory(self.model, embedding, store_config)
        } else if let Some(persistence) = self.persistence {
            EmbeddingStore::with_persistence(self.model, embedding, store_config, persistence)?
        } else {
            EmbeddingStore::open(self.model, embedding, store_config)?
        };

        let lexical = LexicalIndex::build(store.chunks());
        tracing::info!(
            chunker = chunker.name(),
            vectors = store.len(),
            "Opened knowledge base"
        );

        Ok(KnowledgeBase {
            store,
            lexical: RwLock::new(Arc::new(lexical)),
            chunker,
            cleaner: self.cleaner,
            scorer: ConfidenceScorer::new(self.config.confidence.clone()),
            config: self.config,
            writer: async_lock::Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::WhitespaceTokenCounter;
    use crate::config::RetryConfig;
    use crate::error::RagError;
    use crate::testing::{HashEmbedder, MemoryPersistence};
    use crate::types::RetrievalSource;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> RagConfig {
        RagConfig::builder()
            .retry(RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                backoff_multiplier: 2.0,
            })
            .inter_batch_delay(Duration::ZERO)
            .build()
    }

    fn memory_kb() -> KnowledgeBase<HashEmbedder> {
        KnowledgeBase::in_memory(Arc::new(HashEmbedder::new(64)), config()).unwrap()
    }

    fn refund_doc() -> IngestDocument {
        IngestDocument::new("refunds", "Our refund policy allows returns within thirty days.")
            .with("filename", "refunds.md")
    }

    fn shipping_doc() -> IngestDocument {
        IngestDocument::new("shipping", "Parcels ship from the warehouse every weekday morning.")
    }

    #[tokio::test]
    async fn ingest_then_retrieve() {
        let kb = memory_kb();
        let report = kb.ingest(refund_doc()).await.unwrap();
        kb.ingest(shipping_doc()).await.unwrap();

        assert_eq!(report.chunks, 1);
        assert_eq!(report.indexed, 1);
        assert_eq!(kb.stats().document_count, 2);

        let results = kb.retrieve("refund policy", None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source_document_id, "refunds");
        assert_eq!(results[0].source, RetrievalSource::Hybrid);
        assert_eq!(
            results[0].chunk.metadata.get("filename").and_then(|v| v.as_text()),
            Some("refunds.md")
        );
    }

    #[tokio::test]
    async fn reingesting_is_idempotent() {
        let kb = memory_kb();
        kb.ingest(refund_doc()).await.unwrap();
        let before = kb.stats();

        let report = kb.ingest(refund_doc()).await.unwrap();
        assert_eq!(report.duplicates, report.chunks);
        assert_eq!(report.indexed, 0);
        assert_eq!(kb.stats(), before);
    }

    #[tokio::test]
    async fn without_dedup_reingest_replaces() {
        let mut config = config();
        config.deduplication = false;
        let kb = KnowledgeBase::in_memory(Arc::new(HashEmbedder::new(16)), config).unwrap();

        kb.ingest(refund_doc()).await.unwrap();
        let report = kb.ingest(refund_doc()).await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(kb.stats().vector_count, 1);
    }

    #[tokio::test]
    async fn delete_hides_chunks_and_rebuild_purges() {
        let kb = memory_kb();
        kb.ingest(refund_doc()).await.unwrap();
        kb.ingest(shipping_doc()).await.unwrap();

        assert_eq!(kb.delete_document("refunds").await.unwrap(), 1);
        let results = kb.retrieve_with("refund policy", 5, 0.7, None).await;
        assert!(results.iter().all(|r| r.chunk.source_document_id != "refunds"));
        assert_eq!(kb.stats().orphaned_count, 1);
        assert!(kb.lexical().search("refund", 5, None).is_empty());

        kb.rebuild().await.unwrap();
        assert_eq!(kb.stats().orphaned_count, 0);
        assert_eq!(kb.stats().vector_count, 1);
    }

    #[tokio::test]
    async fn empty_knowledge_base_escalates() {
        let kb = memory_kb();
        let ctx = kb.answer_context("anything", None).await;
        assert!(ctx.is_empty());
        assert!(ctx.context.is_empty());

        let confidence = kb.score("I don't know.", &ctx.retrieved, &ctx.query);
        assert!(confidence.should_escalate);
    }

    #[tokio::test]
    async fn answer_context_cites_chunks() {
        let kb = memory_kb();
        kb.ingest(refund_doc()).await.unwrap();

        let ctx = kb.answer_context("refund policy", None).await;
        assert!(ctx.context.starts_with("[source: refunds#chunk_0]\n"));
        assert!(ctx.context.contains("thirty days"));
    }

    #[tokio::test]
    async fn long_documents_are_chunked() {
        let config = RagConfig {
            chunking: crate::config::ChunkingConfig {
                chunk_size_tokens: 8,
                overlap_tokens: 2,
                ..crate::config::ChunkingConfig::default()
            },
            ..config()
        };
        let kb = KnowledgeBase::builder(Arc::new(HashEmbedder::new(32)))
            .config(config)
            .token_counter(Arc::new(WhitespaceTokenCounter))
            .in_memory()
            .build()
            .unwrap();

        let text = (0..40).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let report = kb.ingest(IngestDocument::new("long", text)).await.unwrap();
        assert!(report.chunks >= 5);
        assert_eq!(report.indexed, report.chunks);
        assert_eq!(kb.lexical().len(), report.chunks);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = RagConfig::builder().chunk_size(10, 10).build();
        let err = KnowledgeBase::in_memory(Arc::new(HashEmbedder::new(8)), config).unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn reopen_restores_keyword_index() {
        let dir = tempdir().unwrap();
        let config = RagConfig {
            store: crate::config::StoreConfig {
                index_dir: dir.path().to_path_buf(),
                ..crate::config::StoreConfig::default()
            },
            ..config()
        };
        let model = Arc::new(HashEmbedder::new(32));
        {
            let kb = KnowledgeBase::open(Arc::clone(&model), config.clone()).unwrap();
            kb.ingest(refund_doc()).await.unwrap();
        }

        let kb = KnowledgeBase::open(model, config).unwrap();
        assert_eq!(kb.lexical().len(), 1);
        assert_eq!(kb.lexical().search("refund", 5, None).len(), 1);
    }

    #[tokio::test]
    async fn failed_save_keeps_both_indexes_in_step() {
        let persistence = MemoryPersistence::default();
        let kb = KnowledgeBase::builder(Arc::new(HashEmbedder::new(32)))
            .config(config())
            .persistence(Box::new(persistence.clone()))
            .build()
            .unwrap();
        kb.ingest(refund_doc()).await.unwrap();
        kb.ingest(shipping_doc()).await.unwrap();

        persistence.set_failing(true);
        let new_doc = IngestDocument::new("hours", "Support answers calls nine to five.");
        assert!(kb.ingest(new_doc).await.is_err());
        assert!(kb.delete_document("shipping").await.is_err());

        assert_eq!(kb.stats().vector_count, 2);
        assert_eq!(kb.lexical().len(), 2);
        assert!(kb.lexical().search("calls", 5, None).is_empty());

        let keyword = kb.retrieve_with("warehouse weekday", 5, 0.0, None).await;
        let dense = kb.retrieve_with("warehouse weekday", 5, 1.0, None).await;
        assert_eq!(keyword[0].chunk.source_document_id, "shipping");
        assert_eq!(dense[0].chunk.source_document_id, "shipping");
    }

    #[tokio::test]
    async fn ingests_directories_with_progress() {
        let docs = tempdir().unwrap();
        fs::write(docs.path().join("faq.md"), "# FAQ\n\nRefunds take five days.").unwrap();
        fs::write(docs.path().join("hours.txt"), "Support is open nine to five.").unwrap();
        fs::write(docs.path().join("logo.png"), [0u8, 1, 2]).unwrap();

        let kb = memory_kb();
        let mut stages = Vec::new();
        let count = kb
            .ingest_directory_with_progress(docs.path(), |p| stages.push(p.stage))
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(stages.first(), Some(&IngestStage::Scanning));
        assert_eq!(stages.last(), Some(&IngestStage::Done));
        assert_eq!(kb.stats().document_count, 2);

        let filter = MetadataFilter::new().require("file_type", "md");
        let results = kb.retrieve("refunds", Some(&filter)).await;
        assert!(results.iter().all(|r| r.chunk.source_document_id == "faq.md"));
    }
}
