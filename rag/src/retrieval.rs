//! Hybrid retrieval: dense and keyword search fused into one ranking.
//!
//! [`HybridRetriever::retrieve`] runs both sub-queries concurrently, min-max normalizes each
//! result set, unions them by chunk id, blends the two scores with `alpha`, re-ranks, and drops
//! anything below the relevance floor. It never returns an error: a failed path degrades to the
//! other one, and if both fail the result is empty.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_lite::future;
use relay_core::EmbeddingModel;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::lexical::LexicalIndex;
use crate::store::EmbeddingStore;
use crate::types::{MetadataFilter, RetrievalSource, RetrievedChunk, ScoredChunk};

/// Weight kept from the fused score when blending in rank position.
const RANK_BLEND_SCORE_WEIGHT: f32 = 0.7;
/// Multiplier applied to recency-bearing chunks by [`RerankStrategy::ScoreBoost`].
const RECENCY_BOOST: f32 = 1.1;

/// Re-ranking applied after fusion. Re-ranking reorders, it never changes eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RerankStrategy {
    /// `0.7 * score + 0.3 / (rank + 1)`, with `rank` starting at 0.
    #[default]
    RankBlend,
    /// Multiplies chunks carrying a recency metadata key by 1.1, capped at 1.
    ScoreBoost,
}

/// Source of dense (vector) results.
pub trait DenseRetriever: Send + Sync {
    /// Returns up to `k` chunks with similarity scores, best first.
    fn dense_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> impl Future<Output = Result<Vec<ScoredChunk>>> + Send;
}

/// Source of keyword (lexical) results.
pub trait KeywordRetriever: Send + Sync {
    /// Returns up to `k` chunks with keyword scores, best first.
    ///
    /// # Errors
    /// Implementation specific.
    fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>>;
}

impl<M: EmbeddingModel> DenseRetriever for EmbeddingStore<M> {
    async fn dense_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        self.search(query, k, filter).await
    }
}

impl KeywordRetriever for LexicalIndex {
    fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        Ok(self.search(query, k, filter))
    }
}

impl<T: DenseRetriever> DenseRetriever for &T {
    fn dense_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> impl Future<Output = Result<Vec<ScoredChunk>>> + Send {
        (**self).dense_search(query, k, filter)
    }
}

impl<T: DenseRetriever> DenseRetriever for Arc<T> {
    fn dense_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> impl Future<Output = Result<Vec<ScoredChunk>>> + Send {
        (**self).dense_search(query, k, filter)
    }
}

impl<T: KeywordRetriever> KeywordRetriever for &T {
    fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        (**self).keyword_search(query, k, filter)
    }
}

impl<T: KeywordRetriever> KeywordRetriever for Arc<T> {
    fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        (**self).keyword_search(query, k, filter)
    }
}

/// Min-max normalizes scores to `[0, 1]`, preserving order.
///
/// A single result, or a set whose scores are all equal, normalizes to `1.0` throughout.
#[must_use]
pub fn min_max_normalize(results: &[ScoredChunk]) -> Vec<f32> {
    let (min, max) = results
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r.score), hi.max(r.score))
        });
    let range = max - min;
    results
        .iter()
        .map(|r| {
            if results.len() == 1 || range <= f32::EPSILON {
                1.0
            } else {
                ((r.score - min) / range).clamp(0.0, 1.0)
            }
        })
        .collect()
}

/// Unions both result sets by chunk id and scores each chunk with
/// `alpha * vector + (1 - alpha) * keyword`, treating a missing score as `0`.
///
/// The output is sorted by fused score, best first. Equal scores keep first-seen order, vector
/// results before keyword results. `raw_score` and `normalized_score` both hold the fused score
/// until [`rerank`] runs.
#[must_use]
pub fn fuse(vector: &[ScoredChunk], keyword: &[ScoredChunk], alpha: f32) -> Vec<RetrievedChunk> {
    let mut fused: Vec<RetrievedChunk> = Vec::with_capacity(vector.len() + keyword.len());
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for (hit, score) in vector.iter().zip(min_max_normalize(vector)) {
        if positions.contains_key(hit.chunk.id.as_str()) {
            continue;
        }
        positions.insert(hit.chunk.id.as_str(), fused.len());
        fused.push(RetrievedChunk {
            chunk: Arc::clone(&hit.chunk),
            raw_score: 0.0,
            normalized_score: 0.0,
            source: RetrievalSource::Vector,
            vector_score: Some(score),
            keyword_score: None,
        });
    }

    for (hit, score) in keyword.iter().zip(min_max_normalize(keyword)) {
        match positions.get(hit.chunk.id.as_str()) {
            Some(&at) => {
                let entry = &mut fused[at];
                if entry.keyword_score.is_none() {
                    entry.keyword_score = Some(score);
                    entry.source = RetrievalSource::Hybrid;
                }
            }
            None => {
                positions.insert(hit.chunk.id.as_str(), fused.len());
                fused.push(RetrievedChunk {
                    chunk: Arc::clone(&hit.chunk),
                    raw_score: 0.0,
                    normalized_score: 0.0,
                    source: RetrievalSource::Keyword,
                    vector_score: None,
                    keyword_score: Some(score),
                });
            }
        }
    }

    for entry in &mut fused {
        let score = alpha.mul_add(
            entry.vector_score.unwrap_or_default(),
            (1.0 - alpha) * entry.keyword_score.unwrap_or_default(),
        );
        entry.raw_score = score.clamp(0.0, 1.0);
        entry.normalized_score = entry.raw_score;
    }
    sort_by_score(&mut fused);
    fused
}

/// Applies `strategy` to a list sorted by score and re-sorts it.
///
/// Rank positions are taken from the incoming order.
pub fn rerank(results: &mut [RetrievedChunk], strategy: RerankStrategy, recency_keys: &[String]) {
    for (rank, entry) in results.iter_mut().enumerate() {
        let score = entry.normalized_score;
        entry.normalized_score = match strategy {
            RerankStrategy::RankBlend => {
                #[allow(clippy::cast_precision_loss)]
                let position = 1.0 / (rank + 1) as f32;
                RANK_BLEND_SCORE_WEIGHT.mul_add(score, (1.0 - RANK_BLEND_SCORE_WEIGHT) * position)
            }
            RerankStrategy::ScoreBoost => {
                let recent = recency_keys
                    .iter()
                    .any(|key| entry.chunk.metadata.contains_key(key));
                if recent {
                    (score * RECENCY_BOOST).min(1.0)
                } else {
                    score
                }
            }
        };
    }
    sort_by_score(results);
}

fn sort_by_score(results: &mut [RetrievedChunk]) {
    results.sort_by(|a, b| b.normalized_score.total_cmp(&a.normalized_score));
}

/// Fuses a [`DenseRetriever`] and a [`KeywordRetriever`].
///
/// # Example
///
/// ```rust,no_run
/// use relay_rag::{HybridRetriever, LexicalIndex, RetrievalConfig};
/// # async fn demo(store: relay_rag::EmbeddingStore<impl relay_core::EmbeddingModel>) {
/// let lexical = LexicalIndex::build(store.chunks());
/// let retriever = HybridRetriever::new(&store, &lexical, RetrievalConfig::default());
///
/// let results = retriever.retrieve("how do I reset my password", 5, 0.7, None).await;
/// for hit in &results {
///     println!("{:.2} {}", hit.normalized_score, hit.chunk.id);
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct HybridRetriever<D, K> {
    dense: D,
    keyword: K,
    config: RetrievalConfig,
}

impl<D: DenseRetriever, K: KeywordRetriever> HybridRetriever<D, K> {
    /// Creates a retriever over the two paths.
    #[must_use]
    pub const fn new(dense: D, keyword: K, config: RetrievalConfig) -> Self {
        Self {
            dense,
            keyword,
            config,
        }
    }

    /// Retrieval parameters.
    #[must_use]
    pub const fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieves with the configured `default_top_k` and `alpha`.
    pub async fn retrieve_default(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RetrievedChunk> {
        self.retrieve(query, self.config.default_top_k, self.config.alpha, filter)
            .await
    }

    /// Returns at most `k` chunks ranked by fused, re-ranked score, all at or above the
    /// configured relevance floor.
    ///
    /// `alpha` weights the vector score (`1.0` is vector only, `0.0` keyword only); values
    /// outside `[0, 1]` are clamped. When one path fails the other one carries the full weight.
    #[tracing::instrument(skip_all, fields(k = k, alpha = alpha))]
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        alpha: f32,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RetrievedChunk> {
        if k == 0 {
            return Vec::new();
        }
        let alpha = if alpha.is_nan() {
            self.config.alpha
        } else {
            alpha.clamp(0.0, 1.0)
        };
        let candidates = k.saturating_mul(2).min(self.config.max_candidates).max(1);

        let (dense, keyword) = future::zip(self.dense.dense_search(query, candidates, filter), async {
            self.keyword.keyword_search(query, candidates, filter)
        })
        .await;

        let (vector, keyword, alpha) = match (dense, keyword) {
            (Ok(vector), Ok(keyword)) => (vector, keyword, alpha),
            (Ok(vector), Err(error)) => {
                tracing::warn!(%error, "Keyword retrieval failed, using vector results only");
                (vector, Vec::new(), 1.0)
            }
            (Err(error), Ok(keyword)) => {
                tracing::warn!(%error, "Vector retrieval failed, using keyword results only");
                (Vec::new(), keyword, 0.0)
            }
            (Err(vector_error), Err(keyword_error)) => {
                tracing::warn!(
                    %vector_error,
                    %keyword_error,
                    "Both retrieval paths failed"
                );
                return Vec::new();
            }
        };

        let mut results = fuse(&vector, &keyword, alpha);
        rerank(&mut results, self.config.rerank, &self.config.recency_keys);
        results.truncate(k);
        results.retain(|r| r.normalized_score >= self.config.min_relevance);

        tracing::debug!(
            vector = vector.len(),
            keyword = keyword.len(),
            returned = results.len(),
            "Hybrid retrieval finished"
        );
        results
    }
}
