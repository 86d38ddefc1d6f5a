//! Text chunking strategies for RAG.
//!
//! This module provides the [`Chunker`] trait and implementations for
//! splitting documents into token-bounded, indexable chunks.

mod fixed;
mod semantic;
mod structure;
mod tokens;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub use fixed::FixedSizeChunker;
pub use semantic::SemanticChunker;
pub use structure::StructureAwareChunker;
#[cfg(feature = "hf-tokenizer")]
pub use tokens::HfTokenCounter;
pub use tokens::{ApproxTokenCounter, TokenCounter, WhitespaceTokenCounter};

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::types::{Chunk, IngestDocument, MetadataValue};

/// Trait for text chunking strategies.
///
/// Chunkers split documents into smaller pieces that can be individually
/// embedded and searched:
///
/// - [`FixedSizeChunker`]: token windows with overlap, snapped to natural boundaries
/// - [`SemanticChunker`]: whole sentences, with an optional carried-over sentence
/// - [`StructureAwareChunker`]: one chunk per markdown section where it fits
pub trait Chunker: Send + Sync {
    /// Splits a document into chunks.
    ///
    /// An empty document yields no chunks.
    ///
    /// # Errors
    /// Implementations may fail on invalid configuration.
    fn chunk(&self, doc: &IngestDocument) -> Result<Vec<Chunk>>;

    /// Returns the name of this chunking strategy.
    fn name(&self) -> &'static str;
}

/// Available chunking strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChunkStrategy {
    /// See [`FixedSizeChunker`].
    #[default]
    FixedSize,
    /// See [`SemanticChunker`].
    Semantic,
    /// See [`StructureAwareChunker`].
    StructureAware,
}

impl ChunkStrategy {
    /// Stable name of the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FixedSize => "fixed_size",
            Self::Semantic => "semantic",
            Self::StructureAware => "structure_aware",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the chunker described by `config`.
///
/// # Errors
/// Returns [`RagError::Config`](crate::RagError::Config) if the size parameters are invalid.
pub fn build_chunker(
    config: &ChunkingConfig,
    counter: Arc<dyn TokenCounter>,
) -> Result<Box<dyn Chunker>> {
    let size = config.chunk_size_tokens;
    let overlap = config.overlap_tokens;
    Ok(match config.strategy {
        ChunkStrategy::FixedSize => {
            Box::new(FixedSizeChunker::new(size, overlap)?.with_counter(counter))
        }
        ChunkStrategy::Semantic => {
            Box::new(SemanticChunker::new(size, overlap)?.with_counter(counter))
        }
        ChunkStrategy::StructureAware => {
            Box::new(StructureAwareChunker::new(size, overlap)?.with_counter(counter))
        }
    })
}

/// Chunks one document with the configured strategy and token counter.
///
/// # Errors
/// Returns [`RagError::Config`](crate::RagError::Config) if the size parameters are invalid.
pub fn chunk_document(
    doc: &IngestDocument,
    config: &ChunkingConfig,
    counter: Arc<dyn TokenCounter>,
) -> Result<Vec<Chunk>> {
    build_chunker(config, counter)?.chunk(doc)
}

/// Accumulates chunks for one document, numbering them in order.
pub(crate) struct ChunkSink<'a> {
    doc: &'a IngestDocument,
    counter: &'a dyn TokenCounter,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkSink<'a> {
    pub(crate) fn new(doc: &'a IngestDocument, counter: &'a dyn TokenCounter) -> Self {
        Self {
            doc,
            counter,
            chunks: Vec::new(),
        }
    }

    /// Emits `doc.text[range]` as the next chunk, tagged with its byte offsets.
    pub(crate) fn push(
        &mut self,
        range: Range<usize>,
        extra: impl IntoIterator<Item = (&'static str, MetadataValue)>,
    ) {
        let text = &self.doc.text[range.clone()];
        let mut metadata = self.doc.metadata.clone();
        metadata.insert("chunk_start".into(), range.start.into());
        metadata.insert("chunk_end".into(), range.end.into());
        metadata.extend(extra.into_iter().map(|(k, v)| (k.to_string(), v)));

        let chunk = Chunk::new(
            &self.doc.document_id,
            self.chunks.len(),
            text,
            self.counter.count(text),
            metadata,
        );
        self.chunks.push(chunk);
    }

    pub(crate) fn finish(self) -> Vec<Chunk> {
        self.chunks
    }
}

/// Shrinks `range` so it neither starts nor ends with whitespace.
pub(crate) fn trim_range(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let start = range.start + (slice.len() - slice.trim_start().len());
    let end = range.start + slice.trim_end().len();
    start..end.max(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names() {
        assert_eq!(ChunkStrategy::FixedSize.to_string(), "fixed_size");
        assert_eq!(ChunkStrategy::Semantic.as_str(), "semantic");
        assert_eq!(ChunkStrategy::StructureAware.as_str(), "structure_aware");
    }

    #[test]
    fn build_rejects_bad_overlap() {
        let config = ChunkingConfig {
            strategy: ChunkStrategy::Semantic,
            chunk_size_tokens: 10,
            overlap_tokens: 10,
        };
        assert!(build_chunker(&config, Arc::new(ApproxTokenCounter)).is_err());
    }

    #[test]
    fn every_strategy_handles_empty_documents() {
        let doc = IngestDocument::new("empty", "");
        for strategy in [
            ChunkStrategy::FixedSize,
            ChunkStrategy::Semantic,
            ChunkStrategy::StructureAware,
        ] {
            let config = ChunkingConfig {
                strategy,
                ..ChunkingConfig::default()
            };
            let chunks = chunk_document(&doc, &config, Arc::new(ApproxTokenCounter)).unwrap();
            assert!(chunks.is_empty(), "{strategy} produced chunks");
        }
    }

    #[test]
    fn trim_range_strips_both_ends() {
        let text = "  abc \n";
        assert_eq!(trim_range(text, 0..text.len()), 2..5);
        assert_eq!(trim_range(text, 0..2), 2..2);
    }
}
