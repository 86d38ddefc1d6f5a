//! Core types for the RAG crate.

use relay_core::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

use crate::dedup::content_hash;

/// A metadata value: either free text or an integer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Integer value (offsets, levels, counts).
    Int(i64),
    /// Text value (filenames, headers, dates).
    Text(String),
}

impl MetadataValue {
    /// Returns the text payload, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Int(_) => None,
        }
    }

    /// Returns the integer payload, if this is an integer value.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// Key/value metadata attached to documents and chunks.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A document handed over by the ingestion layer.
///
/// Text extraction from PDF, DOCX and friends happens upstream; by the time a document reaches
/// this crate it is plain text plus metadata to attach to every chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestDocument {
    /// Stable identifier for the document.
    pub document_id: String,
    /// Extracted plain text.
    pub text: String,
    /// Document-level metadata (filename, file type, upload date, ...).
    pub metadata: Metadata,
}

impl IngestDocument {
    /// Creates a new document with empty metadata.
    #[must_use]
    pub fn new(document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A bounded, contiguous slice of a document used as the retrievable unit.
///
/// Chunks are immutable once created. The embedding store and the lexical index share the same
/// `Arc<Chunk>`, so there is a single copy of the text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier (format: `{document_id}#chunk_{sequence_index}`).
    pub id: String,
    /// Text content of the chunk.
    pub text: String,
    /// Parent document ID.
    pub source_document_id: String,
    /// Position of this chunk within its document.
    pub sequence_index: usize,
    /// Token count under the chunker's token counter.
    pub token_count: usize,
    /// Content hash for deduplication.
    pub content_hash: u64,
    /// Inherited document metadata plus chunk-specific entries.
    pub metadata: Metadata,
}

impl Chunk {
    /// Creates a chunk, deriving its id and content hash.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        sequence_index: usize,
        text: impl Into<String>,
        token_count: usize,
        metadata: Metadata,
    ) -> Self {
        let document_id = document_id.into();
        let text = text.into();
        Self {
            id: format!("{document_id}#chunk_{sequence_index}"),
            content_hash: content_hash(&text),
            text,
            source_document_id: document_id,
            sequence_index,
            token_count,
            metadata,
        }
    }

    /// Deterministic embedding id for this chunk.
    #[must_use]
    pub fn embedding_id(&self) -> EmbeddingId {
        EmbeddingId::derive(&self.source_document_id, self.sequence_index)
    }
}

/// Identifier of an embedding slot, derived from `(document_id, sequence_index)`.
///
/// Re-ingesting the same document therefore targets the same ids, which keeps ingestion
/// idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingId(u64);

impl EmbeddingId {
    /// Derives the id for a chunk position.
    #[must_use]
    pub fn derive(document_id: &str, sequence_index: usize) -> Self {
        let key = format!("{document_id}\u{1f}{sequence_index}");
        Self(xxh3_64(key.as_bytes()))
    }

    /// Wraps a raw id (used by persistence backends).
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A vector plus the bookkeeping needed to find its chunk again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Deterministic slot key.
    pub embedding_id: EmbeddingId,
    /// Chunk the vector was computed from.
    pub chunk_id: String,
    /// The vector itself.
    pub vector: Embedding,
    /// Owning document.
    pub document_id: String,
}

/// Which retrieval path produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    /// Only the dense vector path returned the chunk.
    Vector,
    /// Only the BM25 path returned the chunk.
    Keyword,
    /// Both paths returned the chunk.
    Hybrid,
}

/// A chunk with the raw score of a single retrieval path.
#[derive(Clone, Debug, Serialize)]
pub struct ScoredChunk {
    /// The matching chunk.
    pub chunk: Arc<Chunk>,
    /// Path-specific score: `1 / (1 + l2)` for vectors, BM25 for keywords.
    pub score: f32,
}

/// A ranked chunk produced by hybrid retrieval. Never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct RetrievedChunk {
    /// The matching chunk.
    pub chunk: Arc<Chunk>,
    /// Fused score before re-ranking.
    pub raw_score: f32,
    /// Final score after re-ranking, in `[0, 1]`.
    pub normalized_score: f32,
    /// Which paths contributed.
    pub source: RetrievalSource,
    /// Normalized vector score, if the vector path returned this chunk.
    pub vector_score: Option<f32>,
    /// Normalized keyword score, if the keyword path returned this chunk.
    pub keyword_score: Option<f32>,
}

/// Conjunctive equality filter over chunk metadata.
///
/// The pseudo-key `document_id` matches [`Chunk::source_document_id`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    conditions: BTreeMap<String, MetadataValue>,
}

impl MetadataFilter {
    /// Key that matches the chunk's source document rather than a metadata entry.
    pub const DOCUMENT_ID: &'static str = "document_id";

    /// Creates an empty filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `key` to equal `value`.
    #[must_use]
    pub fn require(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    /// Returns `true` if the filter has no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Checks a chunk against every condition.
    #[must_use]
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            if key == Self::DOCUMENT_ID {
                return expected.as_text() == Some(chunk.source_document_id.as_str());
            }
            chunk.metadata.get(key) == Some(expected)
        })
    }
}

impl<K, V> FromIterator<(K, V)> for MetadataFilter
where
    K: Into<String>,
    V: Into<MetadataValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            conditions: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_derives_id_and_hash() {
        let chunk = Chunk::new("doc1", 3, "hello", 2, Metadata::new());
        assert_eq!(chunk.id, "doc1#chunk_3");
        assert_eq!(chunk.content_hash, content_hash("hello"));
        assert_eq!(chunk.embedding_id(), EmbeddingId::derive("doc1", 3));
    }

    #[test]
    fn embedding_ids_are_deterministic_and_distinct() {
        assert_eq!(EmbeddingId::derive("a", 0), EmbeddingId::derive("a", 0));
        assert_ne!(EmbeddingId::derive("a", 0), EmbeddingId::derive("a", 1));
        assert_ne!(EmbeddingId::derive("a1", 0), EmbeddingId::derive("a", 10));
    }

    #[test]
    fn metadata_values_roundtrip_through_json() {
        let mut metadata = Metadata::new();
        metadata.insert("filename".into(), "faq.md".into());
        metadata.insert("chunk_start".into(), 42usize.into());

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"chunk_start":42,"filename":"faq.md"}"#);
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn filter_matches_metadata_and_document() {
        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), "pdf".into());
        let chunk = Chunk::new("doc-7", 0, "text", 1, metadata);

        assert!(MetadataFilter::new().matches(&chunk));
        assert!(MetadataFilter::new().require("file_type", "pdf").matches(&chunk));
        assert!(
            MetadataFilter::new()
                .require(MetadataFilter::DOCUMENT_ID, "doc-7")
                .matches(&chunk)
        );
        assert!(!MetadataFilter::new().require("file_type", "docx").matches(&chunk));
        assert!(!MetadataFilter::new().require("missing", 1i64).matches(&chunk));
    }

    #[test]
    fn retrieval_source_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RetrievalSource::Hybrid).unwrap(),
            r#""hybrid""#
        );
    }
}
