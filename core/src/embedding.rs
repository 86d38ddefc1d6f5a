//! # Embedding providers
//!
//! Embeddings are dense vector representations of text. Similar texts produce nearby vectors,
//! which is what dense retrieval relies on. The provider that produces them is an external
//! dependency with its own latency and error profile: a hosted API that rate-limits, a local
//! model that is slow on first use, or a deterministic test double.
//!
//! [`EmbeddingModel`] is the single seam between relay and that provider. Implementors supply
//! [`dim`](EmbeddingModel::dim) and [`embed`](EmbeddingModel::embed); providers with a native
//! batch endpoint should also override [`embed_batch`](EmbeddingModel::embed_batch).
//!
//! Retry, backoff and pacing are not part of this trait. Callers layer them on top.

use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;

/// A type alias for an embedding vector of 32-bit floats.
pub type Embedding = Vec<f32>;

/// Converts text to vector representations.
///
/// # Implementation Requirements
///
/// - [`embed`](EmbeddingModel::embed) must return vectors with length equal to [`dim`](EmbeddingModel::dim).
/// - [`embed_batch`](EmbeddingModel::embed_batch) must return exactly one vector per input, in
///   input order.
/// - Transient failures (timeouts, rate limits) should be reported as errors rather than retried
///   internally; the caller owns the retry budget.
///
/// # Example
///
/// ```rust
/// use relay_core::EmbeddingModel;
///
/// struct Hosted {
///     api_key: String,
/// }
///
/// impl EmbeddingModel for Hosted {
///     fn dim(&self) -> usize {
///         1536
///     }
///
///     async fn embed(&self, _text: &str) -> relay_core::Result<Vec<f32>> {
///         // A real implementation would call the provider here.
///         Ok(vec![0.0; self.dim()])
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let model = Hosted { api_key: "sk-...".to_string() };
/// let embedding = model.embed("The quick brown fox").await.unwrap();
/// assert_eq!(embedding.len(), 1536);
/// # });
/// ```
pub trait EmbeddingModel: Send + Sync {
    /// Returns the embedding vector dimension.
    ///
    /// Common dimensions include 384 (`MiniLM`), 768 (`BERT-base`) and 1536
    /// (`text-embedding-ada-002`).
    fn dim(&self) -> usize;

    /// Converts a single text to an embedding vector.
    fn embed(&self, text: &str) -> impl Future<Output = crate::Result<Embedding>> + Send;

    /// Converts a batch of texts to embedding vectors, one per input, in order.
    ///
    /// The default implementation calls [`embed`](EmbeddingModel::embed) sequentially and fails
    /// on the first error.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = crate::Result<Vec<Embedding>>> + Send {
        async move {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }
    }
}
