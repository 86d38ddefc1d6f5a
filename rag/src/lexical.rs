//! BM25 keyword index.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::types::{Chunk, MetadataFilter, ScoredChunk};

/// Term-frequency saturation.
pub const K1: f32 = 1.5;
/// Length normalization.
pub const B: f32 = 0.75;

/// Splits text on whitespace, lowercases, and trims punctuation around each word.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// Okapi BM25 over a fixed corpus of chunks.
///
/// The index is immutable once built. When the corpus changes, build a new one from the full
/// chunk set and swap it in; there is no incremental update.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    chunks: Vec<Arc<Chunk>>,
    term_freqs: Vec<HashMap<String, u32>>,
    lengths: Vec<usize>,
    avg_length: f32,
    idf: HashMap<String, f32>,
}

impl LexicalIndex {
    /// Creates an empty index. Every search returns nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index over `chunks`.
    #[must_use]
    #[tracing::instrument(skip_all, fields(chunks = chunks.len()))]
    pub fn build(chunks: Vec<Arc<Chunk>>) -> Self {
        let term_freqs: Vec<HashMap<String, u32>> = chunks
            .par_iter()
            .map(|chunk| {
                let mut freqs = HashMap::new();
                for token in tokenize(&chunk.text) {
                    *freqs.entry(token).or_insert(0) += 1;
                }
                freqs
            })
            .collect();
        let lengths: Vec<usize> = term_freqs
            .iter()
            .map(|freqs| freqs.values().map(|&n| n as usize).sum())
            .collect();

        let mut document_freqs: HashMap<&str, usize> = HashMap::new();
        for freqs in &term_freqs {
            for term in freqs.keys() {
                *document_freqs.entry(term.as_str()).or_insert(0) += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let corpus = chunks.len() as f32;
        let idf = document_freqs
            .into_iter()
            .map(|(term, n)| {
                #[allow(clippy::cast_precision_loss)]
                let n = n as f32;
                (term.to_string(), ((corpus - n + 0.5) / (n + 0.5)).ln_1p())
            })
            .collect();

        #[allow(clippy::cast_precision_loss)]
        let avg_length = if chunks.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f32 / corpus
        };

        tracing::debug!(avg_length, "Built BM25 index");
        Self {
            chunks,
            term_freqs,
            lengths,
            avg_length,
            idf,
        }
    }

    /// Replaces the corpus with `chunks`.
    pub fn index(&mut self, chunks: Vec<Arc<Chunk>>) {
        *self = Self::build(chunks);
    }

    /// Number of indexed chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if nothing has been indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// BM25 score of chunk `doc` for the query terms.
    fn score(&self, doc: usize, terms: &[String]) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let length = self.lengths[doc] as f32;
        let norm = K1 * (1.0 - B + B * length / self.avg_length.max(f32::EPSILON));
        terms
            .iter()
            .filter_map(|term| {
                let tf = *self.term_freqs[doc].get(term)?;
                let idf = self.idf.get(term).copied().unwrap_or_default();
                #[allow(clippy::cast_precision_loss)]
                let tf = tf as f32;
                Some(idf * tf * (K1 + 1.0) / (tf + norm))
            })
            .sum()
    }

    /// Returns up to `k` chunks with a positive BM25 score, best first.
    ///
    /// Ties keep corpus order. An empty index or a query with no indexed terms returns an empty
    /// list.
    #[must_use]
    pub fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<ScoredChunk> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        let terms: Vec<String> = tokenize(query)
            .filter(|term| self.idf.contains_key(term))
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = (0..self.chunks.len())
            .into_par_iter()
            .filter(|&doc| filter.is_none_or(|f| f.matches(&self.chunks[doc])))
            .map(|doc| (doc, self.score(doc, &terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(doc, score)| ScoredChunk {
                chunk: Arc::clone(&self.chunks[doc]),
                score,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn corpus(texts: &[(&str, &str)]) -> LexicalIndex {
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, (doc, text))| Arc::new(Chunk::new(*doc, i, *text, 0, Metadata::new())))
            .collect();
        LexicalIndex::build(chunks)
    }

    #[test]
    fn tokenizer_lowercases_and_trims_punctuation() {
        let tokens: Vec<String> = tokenize("Hello, WORLD! (refund-policy) ...").collect();
        assert_eq!(tokens, vec!["hello", "world", "refund-policy"]);
    }

    #[test]
    fn empty_index_returns_nothing() {
        assert!(LexicalIndex::new().search("anything", 5, None).is_empty());
    }

    #[test]
    fn ranks_matching_chunks() {
        let index = corpus(&[
            ("a", "the quick brown fox jumps over the lazy dog"),
            ("b", "the lazy cat sleeps all day"),
            ("c", "quick brown rabbits hop in the garden"),
        ]);

        let results = index.search("quick brown", 5, None);
        let docs: Vec<&str> = results
            .iter()
            .map(|r| r.chunk.source_document_id.as_str())
            .collect();
        assert_eq!(docs.len(), 2);
        assert!(docs.contains(&"a") && docs.contains(&"c"));
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn rare_terms_weigh_more() {
        let index = corpus(&[
            ("a", "password reset steps"),
            ("b", "password policy overview"),
            ("c", "password expiry rules"),
        ]);
        let results = index.search("password reset", 3, None);
        assert_eq!(results[0].chunk.source_document_id, "a");
    }

    #[test]
    fn single_chunk_corpus_still_matches() {
        let index = corpus(&[("a", "refund policy")]);
        let results = index.search("Refund?", 5, None);
        assert_eq!(results.len(), 1);
        assert!(results[0].score > 0.0);
    }

    #[test]
    fn unmatched_query_returns_nothing() {
        let index = corpus(&[("a", "refund policy")]);
        assert!(index.search("shipping", 5, None).is_empty());
        assert!(index.search("   ", 5, None).is_empty());
    }

    #[test]
    fn truncates_to_k_and_respects_filter() {
        let index = corpus(&[
            ("a", "billing question"),
            ("b", "billing answer"),
            ("c", "billing details"),
        ]);
        assert_eq!(index.search("billing", 2, None).len(), 2);

        let filter = MetadataFilter::new().require(MetadataFilter::DOCUMENT_ID, "c");
        let results = index.search("billing", 5, Some(&filter));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source_document_id, "c");
    }

    #[test]
    fn equal_scores_keep_corpus_order() {
        let index = corpus(&[("a", "same text"), ("b", "same text")]);
        let results = index.search("same", 2, None);
        assert_eq!(results[0].chunk.source_document_id, "a");
        assert_eq!(results[1].chunk.source_document_id, "b");
    }

    #[test]
    fn reindex_replaces_corpus() {
        let mut index = corpus(&[("a", "old words")]);
        index.index(vec![Arc::new(Chunk::new("b", 0, "new words", 0, Metadata::new()))]);
        assert_eq!(index.len(), 1);
        assert!(index.search("old", 5, None).is_empty());
        assert_eq!(index.search("new", 5, None).len(), 1);
    }
}
