//! Configuration for RAG.

use std::path::PathBuf;
use std::time::Duration;

use crate::chunking::ChunkStrategy;
use crate::error::{RagError, Result};
use crate::retrieval::RerankStrategy;

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Which splitting strategy to use.
    pub strategy: ChunkStrategy,
    /// Upper bound on tokens per chunk.
    pub chunk_size_tokens: usize,
    /// Tokens shared by consecutive chunks.
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::FixedSize,
            chunk_size_tokens: 512,
            overlap_tokens: 50,
        }
    }
}

impl ChunkingConfig {
    /// Checks the parameters, failing fast with [`RagError::Config`].
    ///
    /// # Errors
    /// Returns an error if the chunk size is zero or the overlap is not smaller than it.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_tokens == 0 {
            return Err(RagError::config("chunk_size_tokens must be positive"));
        }
        if self.overlap_tokens >= self.chunk_size_tokens {
            return Err(RagError::config(format!(
                "overlap_tokens ({}) must be less than chunk_size_tokens ({})",
                self.overlap_tokens, self.chunk_size_tokens
            )));
        }
        Ok(())
    }
}

/// Configuration for request retry behavior around the embedding provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }
}

/// What ingestion does when one embedding batch exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFailurePolicy {
    /// Abort the whole `index` call; nothing from it is written.
    #[default]
    Abort,
    /// Drop the failed batch's chunks and keep going.
    Skip,
}

/// Embedding generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// Texts per provider call.
    pub batch_size: usize,
    /// Retry policy for each batch.
    pub retry: RetryConfig,
    /// Pause between successive batches.
    pub inter_batch_delay: Duration,
    /// Behaviour when a batch fails for good.
    pub on_batch_failure: BatchFailurePolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            retry: RetryConfig::default(),
            inter_batch_delay: Duration::from_millis(100),
            on_batch_failure: BatchFailurePolicy::Abort,
        }
    }
}

/// Hybrid retrieval parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Number of results when the caller does not specify one.
    pub default_top_k: usize,
    /// Weight of the vector score: 0 = keyword only, 1 = vector only.
    pub alpha: f32,
    /// Results scoring below this after re-ranking are dropped.
    pub min_relevance: f32,
    /// Upper bound on candidates fetched from each path.
    pub max_candidates: usize,
    /// Re-ranking policy applied after fusion.
    pub rerank: RerankStrategy,
    /// Metadata keys whose presence marks a chunk as recency-bearing.
    pub recency_keys: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            alpha: 0.7,
            min_relevance: 0.3,
            max_candidates: 20,
            rerank: RerankStrategy::RankBlend,
            recency_keys: vec!["upload_date".into(), "updated_at".into()],
        }
    }
}

impl RetrievalConfig {
    /// Checks the parameters.
    ///
    /// # Errors
    /// Returns [`RagError::Config`] if `alpha` or `min_relevance` is outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(RagError::config(format!(
                "alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(RagError::config(format!(
                "min_relevance must be within [0, 1], got {}",
                self.min_relevance
            )));
        }
        Ok(())
    }
}

/// Confidence scoring parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceConfig {
    /// Confidence below this escalates.
    pub escalation_threshold: f32,
    /// Phrases that force escalation when present in the answer (case-insensitive).
    pub handoff_phrases: Vec<String>,
    /// Markers that count as a source citation (case-insensitive).
    pub citation_markers: Vec<String>,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 0.7,
            handoff_phrases: [
                "i don't know",
                "i do not know",
                "i'm not sure",
                "i am not sure",
                "speak to a human",
                "talk to a human",
                "contact support",
                "transfer you",
                "human agent",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            citation_markers: ["[source", "[doc", "source:", "according to"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// On-disk format for the vector index and its metadata side-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceBackend {
    /// rkyv vector blob plus JSON side-file, each replaced by rename.
    #[default]
    Files,
    /// Both artifacts as tables in one redb transaction.
    Redb,
}

/// Embedding store parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the persisted artifacts.
    pub index_dir: PathBuf,
    /// Storage format.
    pub backend: PersistenceBackend,
    /// Live vector count at which search switches from exact scan to HNSW.
    pub ann_threshold: usize,
    /// Persist after every write operation.
    pub auto_save: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("./relay_index"),
            backend: PersistenceBackend::Files,
            ann_threshold: 2048,
            auto_save: true,
        }
    }
}

/// Configuration for a knowledge base instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RagConfig {
    /// Chunking parameters.
    pub chunking: ChunkingConfig,
    /// Embedding generation parameters.
    pub embedding: EmbeddingConfig,
    /// Hybrid retrieval parameters.
    pub retrieval: RetrievalConfig,
    /// Confidence scoring parameters.
    pub confidence: ConfidenceConfig,
    /// Embedding store parameters.
    pub store: StoreConfig,
    /// Whether to drop chunks whose content is already indexed.
    pub deduplication: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            confidence: ConfidenceConfig::default(),
            store: StoreConfig::default(),
            deduplication: true,
        }
    }
}

impl RagConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::new()
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first [`RagError::Config`] found.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.retrieval.validate()?;
        if self.embedding.batch_size == 0 {
            return Err(RagError::config("batch_size must be positive"));
        }
        if self.embedding.retry.max_attempts == 0 {
            return Err(RagError::config("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for RAG configuration.
#[derive(Debug)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl Default for RagConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RagConfigBuilder {
    /// Creates a new configuration builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RagConfig::new(),
        }
    }

    /// Sets the directory for persisted artifacts.
    #[must_use]
    pub fn index_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store.index_dir = path.into();
        self
    }

    /// Selects the persistence backend.
    #[must_use]
    pub const fn backend(mut self, backend: PersistenceBackend) -> Self {
        self.config.store.backend = backend;
        self
    }

    /// Sets the live vector count at which HNSW search kicks in.
    #[must_use]
    pub const fn ann_threshold(mut self, threshold: usize) -> Self {
        self.config.store.ann_threshold = threshold;
        self
    }

    /// Enables or disables automatic saving after writes.
    #[must_use]
    pub const fn auto_save(mut self, enabled: bool) -> Self {
        self.config.store.auto_save = enabled;
        self
    }

    /// Sets the chunking strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.config.chunking.strategy = strategy;
        self
    }

    /// Sets chunk size and overlap, in tokens.
    #[must_use]
    pub const fn chunk_size(mut self, chunk_size_tokens: usize, overlap_tokens: usize) -> Self {
        self.config.chunking.chunk_size_tokens = chunk_size_tokens;
        self.config.chunking.overlap_tokens = overlap_tokens;
        self
    }

    /// Sets the embedding batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.embedding.batch_size = batch_size;
        self
    }

    /// Sets the retry policy for embedding batches.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.embedding.retry = retry;
        self
    }

    /// Sets the pause between embedding batches.
    #[must_use]
    pub const fn inter_batch_delay(mut self, delay: Duration) -> Self {
        self.config.embedding.inter_batch_delay = delay;
        self
    }

    /// Sets what happens when a batch fails for good.
    #[must_use]
    pub const fn on_batch_failure(mut self, policy: BatchFailurePolicy) -> Self {
        self.config.embedding.on_batch_failure = policy;
        self
    }

    /// Sets the default vector weight for hybrid retrieval.
    #[must_use]
    pub const fn alpha(mut self, alpha: f32) -> Self {
        self.config.retrieval.alpha = alpha;
        self
    }

    /// Sets the default number of results.
    #[must_use]
    pub const fn default_top_k(mut self, k: usize) -> Self {
        self.config.retrieval.default_top_k = k;
        self
    }

    /// Sets the minimum relevance after re-ranking.
    #[must_use]
    pub const fn min_relevance(mut self, threshold: f32) -> Self {
        self.config.retrieval.min_relevance = threshold;
        self
    }

    /// Sets the re-ranking strategy.
    #[must_use]
    pub const fn rerank(mut self, strategy: RerankStrategy) -> Self {
        self.config.retrieval.rerank = strategy;
        self
    }

    /// Sets the escalation threshold.
    #[must_use]
    pub const fn escalation_threshold(mut self, threshold: f32) -> Self {
        self.config.confidence.escalation_threshold = threshold;
        self
    }

    /// Enables or disables content deduplication.
    #[must_use]
    pub const fn deduplication(mut self, enabled: bool) -> Self {
        self.config.deduplication = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> RagConfig {
        self.config
    }
}
