//! Fixed-size text chunking.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::types::{Chunk, IngestDocument};

use super::{ApproxTokenCounter, ChunkSink, ChunkStrategy, Chunker, TokenCounter};

/// Chunks text into token windows with configurable overlap.
///
/// Each window holds at most `chunk_size` tokens. The cut point is pulled back to the last
/// paragraph break, then sentence end, then whitespace found in the second half of the window,
/// and only falls back to a hard cut when none exists. Consecutive chunks share a suffix/prefix
/// of roughly `overlap` tokens that always starts on a word.
///
/// Chunks are exact slices of the document text: dropping each chunk's overlap prefix and
/// concatenating the rest gives back the original text.
///
/// # Example
///
/// ```rust
/// use relay_rag::chunking::{Chunker, FixedSizeChunker};
/// use relay_rag::IngestDocument;
///
/// let chunker = FixedSizeChunker::new(100, 20).unwrap();
/// let doc = IngestDocument::new("doc1", "Long text content...");
/// let chunks = chunker.chunk(&doc).unwrap();
/// assert_eq!(chunks.len(), 1);
/// ```
#[derive(Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    overlap: usize,
    counter: Arc<dyn TokenCounter>,
}

impl FixedSizeChunker {
    /// Creates a new fixed-size chunker using the approximate token counter.
    ///
    /// # Errors
    /// Returns [`RagError::Config`](crate::RagError::Config) if `chunk_size` is zero or
    /// `overlap >= chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        ChunkingConfig {
            strategy: ChunkStrategy::FixedSize,
            chunk_size_tokens: chunk_size,
            overlap_tokens: overlap,
        }
        .validate()?;
        Ok(Self {
            chunk_size,
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
}

impl fmt::Debug for FixedSizeChunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeChunker")
            .field("chunk_size", &self.chunk_size)
            .field("overlap", &self.overlap)
            .field("counter", &self.counter.name())
            .finish()
    }
}

impl Chunker for FixedSizeChunker {
    #[tracing::instrument(skip_all, fields(document_id = %doc.document_id, strategy = "fixed_size"))]
    fn chunk(&self, doc: &IngestDocument) -> Result<Vec<Chunk>> {
        let mut sink = ChunkSink::new(doc, self.counter.as_ref());
        for span in split_spans(&doc.text, self.chunk_size, self.overlap, self.counter.as_ref()) {
            sink.push(span, []);
        }
        let chunks = sink.finish();
        tracing::debug!(chunks = chunks.len(), "chunked document");
        Ok(chunks)
    }

    fn name(&self) -> &'static str {
        "fixed_size"
    }
}

/// Computes the byte ranges of fixed-size windows over `text`.
///
/// Whitespace-only text has no windows. Trailing whitespace that would otherwise form its own
/// window is folded into the last one.
pub(crate) fn split_spans(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    counter: &dyn TokenCounter,
) -> Vec<Range<usize>> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let splitter = Splitter::new(text, chunk_size, overlap, counter);
    let mut spans = Vec::new();
    let mut start = 0;
    let mut prev_end = 0;

    loop {
        let limit = splitter.window_limit(start);
        let mut end = if limit >= text.len() {
            text.len()
        } else {
            splitter.snap(start, limit, prev_end)
        };
        if text[end..].trim().is_empty() {
            end = text.len();
        }

        spans.push(start..end);
        if end == text.len() {
            break;
        }

        start = splitter.next_start(start, end);
        prev_end = end;
    }

    spans
}

struct Splitter<'a> {
    text: &'a str,
    chunk_size: usize,
    overlap: usize,
    counter: &'a dyn TokenCounter,
    /// Byte offset just past each char.
    char_ends: Vec<usize>,
    /// Byte offsets where a word begins.
    word_starts: Vec<usize>,
}

impl<'a> Splitter<'a> {
    fn new(text: &'a str, chunk_size: usize, overlap: usize, counter: &'a dyn TokenCounter) -> Self {
        let char_ends = text.char_indices().map(|(i, c)| i + c.len_utf8()).collect();

        let mut word_starts = Vec::new();
        let mut prev_is_space = true;
        for (i, c) in text.char_indices() {
            let is_space = c.is_whitespace();
            if prev_is_space && !is_space {
                word_starts.push(i);
            }
            prev_is_space = is_space;
        }

        Self {
            text,
            chunk_size,
            overlap,
            counter,
            char_ends,
            word_starts,
        }
    }

    fn fits(&self, start: usize, end: usize) -> bool {
        self.counter.count(&self.text[start..end]) <= self.chunk_size
    }

    /// Largest char boundary `end > start` with at most `chunk_size` tokens in `start..end`.
    ///
    /// Always advances by at least one char.
    fn window_limit(&self, start: usize) -> usize {
        let ends = &self.char_ends[self.char_ends.partition_point(|&e| e <= start)..];
        let Some(&first) = ends.first() else {
            return self.text.len();
        };
        if !self.fits(start, first) {
            return first;
        }

        // Gallop, then bisect, so each probe stays close to one window in length.
        let mut lo = 0;
        let mut hi = ends.len();
        let mut step = self.chunk_size.max(1);
        loop {
            let probe = lo + step;
            if probe >= ends.len() {
                break;
            }
            if self.fits(start, ends[probe]) {
                lo = probe;
                step = step.saturating_mul(2);
            } else {
                hi = probe;
                break;
            }
        }
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.fits(start, ends[mid]) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        ends[lo]
    }

    /// Pulls `limit` back to a paragraph, sentence or word boundary in the second half of the
    /// window. Cuts must land past `prev_end` so every chunk adds new text.
    fn snap(&self, start: usize, limit: usize, prev_end: usize) -> usize {
        let window = &self.text[start..limit];
        let floor = (start + window.len() / 2).max(prev_end + 1);
        let accept = |offset: usize| {
            let cut = start + offset;
            (cut >= floor).then_some(cut)
        };

        window
            .rfind("\n\n")
            .and_then(|pos| accept(pos + 2))
            .or_else(|| sentence_break(window).and_then(accept))
            .or_else(|| {
                if self.text[limit..].starts_with(char::is_whitespace) {
                    return accept(window.len());
                }
                word_break(window).and_then(accept)
            })
            .unwrap_or(limit)
    }

    /// Start of the window after one ending at `end`: the earliest word start whose suffix up to
    /// `end` holds at most `overlap` tokens.
    fn next_start(&self, start: usize, end: usize) -> usize {
        if self.overlap == 0 {
            return end;
        }
        let lo = self.word_starts.partition_point(|&p| p <= start);
        let hi = self.word_starts.partition_point(|&p| p < end);
        let candidates = &self.word_starts[lo..hi];
        let first_fit =
            candidates.partition_point(|&p| self.counter.count(&self.text[p..end]) > self.overlap);
        candidates.get(first_fit).copied().unwrap_or(end)
    }
}

/// Offset just past the whitespace that follows the last `.`, `!` or `?` in `window`.
fn sentence_break(window: &str) -> Option<usize> {
    let mut last = None;
    let mut chars = window.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?')
            && let Some(&(next_pos, next)) = chars.peek()
            && next.is_whitespace()
        {
            last = Some(next_pos + next.len_utf8());
        }
    }
    last
}

/// Offset just past the last whitespace char in `window`.
fn word_break(window: &str) -> Option<usize> {
    window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
}
