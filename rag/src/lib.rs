//! # relay-rag
//!
//! Retrieval core for a support assistant that has to know when to hand over to a human.
//!
//! Documents go in as plain text plus metadata. They are cleaned, split into token-bounded
//! [`Chunk`]s, deduplicated by content hash, embedded through any
//! [`EmbeddingModel`](relay_core::EmbeddingModel), and indexed twice: as vectors in the
//! [`EmbeddingStore`] and as terms in a BM25 [`LexicalIndex`]. A query runs against both, the two
//! result sets are normalized and fused by the [`HybridRetriever`], and the
//! [`ConfidenceScorer`] turns the ranked chunks plus a generated answer into an escalation signal.
//!
//! ```text
//! IngestDocument ─▶ Cleaner ─▶ Chunker ─▶ Deduplicator ─▶ EmbeddingStore ──┐
//!                                                      └─▶ LexicalIndex ───┤
//!                                                                          ▼
//!                      query ─────────────────────────────────▶ HybridRetriever
//!                                                                          │
//!                      answer ─────────────────────────────────▶ ConfidenceScorer
//! ```
//!
//! [`KnowledgeBase`] wires all of this together and is the usual entry point.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_rag::{IngestDocument, KnowledgeBase, RagConfig};
//!
//! # async fn demo(model: impl relay_core::EmbeddingModel) -> relay_rag::Result<()> {
//! let config = RagConfig::builder()
//!     .index_dir("./support_index")
//!     .alpha(0.7)
//!     .escalation_threshold(0.7)
//!     .build();
//! let kb = KnowledgeBase::open(Arc::new(model), config)?;
//!
//! kb.ingest(
//!     IngestDocument::new("billing-faq", "Invoices are sent on the first of each month.")
//!         .with("filename", "billing.md")
//!         .with("upload_date", "2024-05-01"),
//! )
//! .await?;
//!
//! let ctx = kb.answer_context("when are invoices sent?", None).await;
//! let answer = "Invoices go out on the 1st. [source: billing-faq#chunk_0]";
//! let confidence = kb.score(answer, &ctx.retrieved, &ctx.query);
//! println!("confidence {:.2}, escalate: {}", confidence.score, confidence.should_escalate);
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! The store keeps a vector blob and a metadata side-file that must always agree. Both backends
//! commit them as a pair: [`FilePersistence`] with a `CURRENT` pointer swapped by rename,
//! [`RedbPersistence`] with a single transaction. A missing index is an empty store; an
//! inconsistent one is logged and discarded.
//!
//! ## Deletion
//!
//! Deleting a document tombstones its vectors. Tombstoned vectors never appear in results, but
//! occupy space until [`KnowledgeBase::rebuild`] compacts the index.

pub mod chunking;
pub mod cleaning;
pub mod confidence;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod knowledge;
pub mod lexical;
pub mod persistence;
pub mod retrieval;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use chunking::{
    ApproxTokenCounter, ChunkStrategy, Chunker, FixedSizeChunker, SemanticChunker,
    StructureAwareChunker, TokenCounter, WhitespaceTokenCounter, chunk_document,
};
pub use cleaning::{BasicCleaner, Cleaner, NoopCleaner};
pub use confidence::{ConfidenceFactors, ConfidenceResult, ConfidenceScorer};
pub use config::{
    BatchFailurePolicy, ChunkingConfig, ConfidenceConfig, EmbeddingConfig, PersistenceBackend,
    RagConfig, RagConfigBuilder, RetrievalConfig, RetryConfig, StoreConfig,
};
pub use dedup::{DedupOutcome, Deduplicator, content_hash, deduplicate};
pub use embedding::{BatchOutcome, EmbeddingGenerator};
pub use error::{RagError, Result};
pub use ingest::{IngestProgress, IngestStage};
pub use knowledge::{AnswerContext, IngestReport, KnowledgeBase, KnowledgeBaseBuilder};
pub use lexical::LexicalIndex;
pub use persistence::{FilePersistence, IndexSnapshot, Persistence, RedbPersistence};
pub use retrieval::{DenseRetriever, HybridRetriever, KeywordRetriever, RerankStrategy};
pub use store::{EmbeddingStore, IndexOutcome, StoreStats};
pub use types::{
    Chunk, EmbeddingId, EmbeddingRecord, IngestDocument, Metadata, MetadataFilter, MetadataValue,
    RetrievalSource, RetrievedChunk, ScoredChunk,
};
