//! Error types for the RAG crate.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in RAG operations.
///
/// Retrieval never returns these: a failed sub-query degrades to the surviving path, and a total
/// failure yields an empty result set so the caller can still reach an escalation decision.
#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid chunking or retrieval parameters. Always the caller's fault.
    #[error("configuration error: {0}")]
    Config(String),

    /// The embedding provider kept failing after the retry budget was spent.
    #[error("embedding provider failed on batch {batch} after {attempts} attempt(s): {source}")]
    EmbeddingProvider {
        /// Zero-based index of the failed batch within the `generate` call.
        batch: usize,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Last provider error.
        #[source]
        source: anyhow::Error,
    },

    /// The provider answered, but with the wrong number of vectors.
    #[error("provider returned {actual} embedding(s) for {expected} input(s)")]
    MalformedEmbeddings {
        /// Number of inputs sent.
        expected: usize,
        /// Number of vectors received.
        actual: usize,
    },

    /// Dimension mismatch between an embedding and the index.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension provided.
        actual: usize,
    },

    /// The persisted vector blob and metadata side-file disagree.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// Persistence operation failed.
    #[error("persistence error at {path}: {source}")]
    Persistence {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),
}

impl RagError {
    /// Returns `true` if retrying the same provider call could succeed.
    ///
    /// Only raw provider failures qualify. A malformed response is a contract violation and is
    /// surfaced immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::EmbeddingProvider { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
