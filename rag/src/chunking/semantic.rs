//! Sentence-based text chunking.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use unicode_segmentation::UnicodeSegmentation;

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::types::{Chunk, IngestDocument};

use super::fixed::split_spans;
use super::{ApproxTokenCounter, ChunkSink, ChunkStrategy, Chunker, TokenCounter, trim_range};

/// Chunks text by sentence boundaries.
///
/// Sentences are packed into a chunk until the next one would push it past `max_tokens`. The
/// following chunk starts with the previous chunk's last sentence when that sentence is shorter
/// than `overlap` tokens, giving an approximate overlap without cutting sentences. A single
/// sentence longer than `max_tokens` is split with the fixed-size algorithm.
///
/// # Example
///
/// ```rust
/// use relay_rag::chunking::{Chunker, SemanticChunker};
/// use relay_rag::IngestDocument;
///
/// let chunker = SemanticChunker::new(500, 50).unwrap();
/// let doc = IngestDocument::new("doc1", "First sentence. Second sentence. Third sentence.");
/// let chunks = chunker.chunk(&doc).unwrap();
/// assert_eq!(chunks.len(), 1);
/// ```
#[derive(Clone)]
pub struct SemanticChunker {
    max_tokens: usize,
    overlap: usize,
    counter: Arc<dyn TokenCounter>,
}

impl SemanticChunker {
    /// Creates a new sentence chunker using the approximate token counter.
    ///
    /// # Errors
    /// Returns [`RagError::Config`](crate::RagError::Config) if `max_tokens` is zero or
    /// `overlap >= max_tokens`.
    pub fn new(max_tokens: usize, overlap: usize) -> Result<Self> {
        ChunkingConfig {
            strategy: ChunkStrategy::Semantic,
            chunk_size_tokens: max_tokens,
            overlap_tokens: overlap,
        }
        .validate()?;
        Ok(Self {
            max_tokens,
            overlap,
            counter: Arc::new(ApproxTokenCounter),
        })
    }

    /// Replaces the token counter.
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    fn tokens(&self, text: &str, range: &Range<usize>) -> usize {
        self.counter.count(&text[range.clone()])
    }
}

impl fmt::Debug for SemanticChunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemanticChunker")
            .field("max_tokens", &self.max_tokens)
            .field("overlap", &self.overlap)
            .field("counter", &self.counter.name())
            .finish()
    }
}

impl Chunker for SemanticChunker {
    #[tracing::instrument(skip_all, fields(document_id = %doc.document_id, strategy = "semantic"))]
    fn chunk(&self, doc: &IngestDocument) -> Result<Vec<Chunk>> {
        let text = doc.text.as_str();
        let sentences: Vec<Range<usize>> = text
            .split_sentence_bound_indices()
            .map(|(start, sentence)| trim_range(text, start..start + sentence.len()))
            .filter(|range| !range.is_empty())
            .collect();

        let mut sink = ChunkSink::new(doc, self.counter.as_ref());
        // Sentences of the chunk being built, as a contiguous run.
        let mut current: Option<Range<usize>> = None;
        let mut last_sentence: Option<Range<usize>> = None;

        for sentence in sentences {
            if self.tokens(text, &sentence) > self.max_tokens {
                if let Some(run) = current.take() {
                    sink.push(run, []);
                }
                last_sentence = None;
                let slice = &text[sentence.clone()];
                for span in split_spans(slice, self.max_tokens, self.overlap, self.counter.as_ref())
                {
                    sink.push(sentence.start + span.start..sentence.start + span.end, []);
                }
                continue;
            }

            if let Some(run) = current.clone() {
                if self.tokens(text, &(run.start..sentence.end)) <= self.max_tokens {
                    current = Some(run.start..sentence.end);
                    last_sentence = Some(sentence);
                    continue;
                }

                sink.push(run, []);
                current = last_sentence
                    .take()
                    .filter(|last| self.tokens(text, last) < self.overlap)
                    .filter(|last| self.tokens(text, &(last.start..sentence.end)) <= self.max_tokens)
                    .map(|last| last.start..sentence.end);
            }

            if current.is_none() {
                current = Some(sentence.clone());
            }
            last_sentence = Some(sentence);
        }

        if let Some(run) = current {
            sink.push(run, []);
        }

        let chunks = sink.finish();
        tracing::debug!(chunks = chunks.len(), "chunked document");
        Ok(chunks)
    }

    fn name(&self) -> &'static str {
        "semantic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::WhitespaceTokenCounter;

    fn chunker(max_tokens: usize, overlap: usize) -> SemanticChunker {
        SemanticChunker::new(max_tokens, overlap)
            .unwrap()
            .with_counter(Arc::new(WhitespaceTokenCounter))
    }

    #[test]
    fn small_text_single_chunk() {
        let doc = IngestDocument::new("doc1", "Hello world. How are you?");
        let chunks = chunker(50, 5).chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world. How are you?");
    }

    #[test]
    fn splits_at_sentence_boundaries() {
        let doc = IngestDocument::new(
            "doc1",
            "One two three four. Five six seven eight. Nine ten eleven twelve.",
        );
        let chunks = chunker(8, 0).chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "One two three four. Five six seven eight.");
        assert_eq!(chunks[1].text, "Nine ten eleven twelve.");
    }

    #[test]
    fn carries_short_last_sentence() {
        let doc = IngestDocument::new(
            "doc1",
            "Alpha beta gamma delta epsilon. Short one. Zeta eta theta iota kappa.",
        );
        let chunks = chunker(8, 3).chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Alpha beta gamma delta epsilon. Short one.");
        assert_eq!(chunks[1].text, "Short one. Zeta eta theta iota kappa.");
    }

    #[test]
    fn does_not_carry_long_last_sentence() {
        let doc = IngestDocument::new(
            "doc1",
            "Alpha beta gamma. Delta epsilon zeta eta. Theta iota kappa lambda.",
        );
        let chunks = chunker(8, 3).chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].text, "Theta iota kappa lambda.");
    }

    #[test]
    fn oversized_sentence_is_split() {
        let long = (0..30).map(|i| format!("W{i}")).collect::<Vec<_>>().join(" ");
        let text = format!("Intro here. {long}.");
        let doc = IngestDocument::new("doc1", text.as_str());
        let chunks = chunker(10, 2).chunk(&doc).unwrap();

        assert_eq!(chunks[0].text, "Intro here.");
        assert!(chunks.len() >= 4);
        for chunk in &chunks {
            assert!(chunk.token_count <= 10);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence_index, i);
        }
    }

    #[test]
    fn lowercase_continuation_stays_in_sentence() {
        // UAX #29 does not break after a period followed by a lowercase word.
        let doc = IngestDocument::new("doc1", "Intro. then more words follow");
        let chunks = chunker(4, 0).chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with("Intro. then more words"));
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn records_offsets() {
        let doc = IngestDocument::new("doc1", "First one here. Second one here.");
        let chunks = chunker(3, 0).chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].metadata["chunk_start"].as_int(), Some(16));
        assert_eq!(chunks[1].metadata["chunk_end"].as_int(), Some(32));
    }
}
