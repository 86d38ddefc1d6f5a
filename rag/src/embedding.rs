//! Batched embedding generation with bounded retry.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{Embedding, EmbeddingModel};

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

/// Result of embedding one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Zero-based batch index within the call.
    pub batch: usize,
    /// Positions of the batch's texts in the input slice.
    pub range: Range<usize>,
    /// One vector per input text, or the error that ended the batch.
    pub result: Result<Vec<Embedding>>,
}

/// Per-batch retry state, local to one `generate` call.
enum BatchState {
    Pending,
    Retrying(u32),
    Succeeded(Vec<Embedding>),
    Failed(RagError),
}

/// Sends texts to an [`EmbeddingModel`] in sequential batches.
///
/// Each batch is attempted up to `retry.max_attempts` times with exponential backoff between
/// attempts. Batches never run concurrently, and `inter_batch_delay` separates successive ones.
pub struct EmbeddingGenerator<M> {
    model: Arc<M>,
    config: EmbeddingConfig,
}

impl<M> Clone for EmbeddingGenerator<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            config: self.config.clone(),
        }
    }
}

impl<M> fmt::Debug for EmbeddingGenerator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingGenerator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M: EmbeddingModel> EmbeddingGenerator<M> {
    /// Creates a generator around a shared model.
    #[must_use]
    pub const fn new(model: Arc<M>, config: EmbeddingConfig) -> Self {
        Self { model, config }
    }

    /// The underlying model.
    #[must_use]
    pub const fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Embeds every text, failing on the first batch that exhausts its retries.
    ///
    /// # Errors
    /// Returns [`RagError::EmbeddingProvider`] or [`RagError::MalformedEmbeddings`] from the first
    /// failing batch. Later batches are not sent.
    pub async fn generate(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (batch, range) in self.batch_ranges(texts.len()).enumerate() {
            if batch > 0 {
                sleep(self.config.inter_batch_delay).await;
            }
            vectors.extend(self.run_batch(batch, &texts[range]).await?);
        }
        Ok(vectors)
    }

    /// Embeds every text and reports each batch separately, so the caller can skip failed
    /// batches instead of aborting.
    pub async fn generate_batches(&self, texts: &[String]) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::new();
        for (batch, range) in self.batch_ranges(texts.len()).enumerate() {
            if batch > 0 {
                sleep(self.config.inter_batch_delay).await;
            }
            let result = self.run_batch(batch, &texts[range.clone()]).await;
            outcomes.push(BatchOutcome {
                batch,
                range,
                result,
            });
        }
        outcomes
    }

    /// Embeds a single query text with the same retry policy.
    ///
    /// # Errors
    /// Returns the provider error once retries are exhausted.
    pub async fn embed_query(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.run_batch(0, &[text.to_string()]).await?;
        vectors.pop().ok_or(RagError::MalformedEmbeddings {
            expected: 1,
            actual: 0,
        })
    }

    fn batch_ranges(&self, len: usize) -> impl Iterator<Item = Range<usize>> + use<M> {
        let size = self.config.batch_size.max(1);
        (0..len)
            .step_by(size)
            .map(move |start| start..(start + size).min(len))
    }

    async fn run_batch(&self, batch: usize, texts: &[String]) -> Result<Vec<Embedding>> {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut state = BatchState::Pending;

        loop {
            let attempt = match state {
                BatchState::Pending => 1,
                BatchState::Retrying(failed) => failed + 1,
                BatchState::Succeeded(vectors) => {
                    tracing::debug!(batch, size = texts.len(), "Embedded batch");
                    return Ok(vectors);
                }
                BatchState::Failed(err) => {
                    tracing::error!(batch, error = %err, "Embedding batch failed");
                    return Err(err);
                }
            };

            state = match self.call(batch, attempt, texts).await {
                Ok(vectors) => BatchState::Succeeded(vectors),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        batch,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Embedding batch failed, retrying"
                    );
                    sleep(delay).await;
                    BatchState::Retrying(attempt)
                }
                Err(err) => BatchState::Failed(err),
            };
        }
    }

    async fn call(&self, batch: usize, attempt: u32, texts: &[String]) -> Result<Vec<Embedding>> {
        let vectors = self
            .model
            .embed_batch(texts)
            .await
            .map_err(|source| RagError::EmbeddingProvider {
                batch,
                attempts: attempt,
                source,
            })?;
        if vectors.len() != texts.len() {
            return Err(RagError::MalformedEmbeddings {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

/// Sleep for the given duration (runtime-agnostic).
async fn sleep(duration: Duration) {
    if !duration.is_zero() {
        async_io::Timer::after(duration).await;
    }
}
