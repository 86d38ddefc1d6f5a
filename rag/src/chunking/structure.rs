//! Markdown-structure-aware chunking.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::types::{Chunk, IngestDocument, MetadataValue};

use super::fixed::split_spans;
use super::{ApproxTokenCounter, ChunkSink, ChunkStrategy, Chunker, TokenCounter, trim_range};

/// Chunks markdown-like text section by section.
///
/// Lines starting with `#` to `######` followed by a space open a new section. A section that
/// fits in `max_tokens` becomes one chunk; a larger one is split with the fixed-size algorithm.
/// Every chunk of a section carries `section_header` and `section_level` metadata. Text before
/// the first header forms an untagged section.
#[derive(Clone)]
pub struct StructureAwareChunker {
    max_tokens: usize,
    overlap: usize,
    counter: Arc<dyn TokenCounter>,
}

impl StructureAwareChunker {
    /// Creates a new structure-aware chunker using the approximate token counter.
    ///
    /// # Errors
    /// Returns [`RagError::Config`](crate::RagError::Config) if `max_tokens` is zero or
    /// `overlap >= max_tokens`.
    pub fn new(max_tokens: usize, overlap: usize) -> Result<Self> {
        ChunkingConfig {
            strategy: ChunkStrategy::StructureAware,
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
}

impl fmt::Debug for StructureAwareChunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructureAwareChunker")
            .field("max_tokens", &self.max_tokens)
            .field("overlap", &self.overlap)
            .field("counter", &self.counter.name())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Section {
    range: Range<usize>,
    header: Option<(String, usize)>,
}

/// Returns `(title, level)` if `line` is a markdown ATX header.
fn parse_header(line: &str) -> Option<(String, usize)> {
    let line = line.trim_end();
    let level = line.bytes().take_while(|&b| b == b'#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some((rest.trim().to_string(), level))
}

fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        range: 0..0,
        header: None,
    };

    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if let Some(header) = parse_header(line) {
            if offset > current.range.start {
                current.range.end = offset;
                sections.push(current);
            }
            current = Section {
                range: offset..offset,
                header: Some(header),
            };
        }
        offset += line.len();
    }
    current.range.end = text.len();
    sections.push(current);
    sections
}

impl Chunker for StructureAwareChunker {
    #[tracing::instrument(skip_all, fields(document_id = %doc.document_id, strategy = "structure_aware"))]
    fn chunk(&self, doc: &IngestDocument) -> Result<Vec<Chunk>> {
        let text = doc.text.as_str();
        let mut sink = ChunkSink::new(doc, self.counter.as_ref());

        for section in split_sections(text) {
            let range = trim_range(text, section.range);
            if range.is_empty() {
                continue;
            }
            let tags = |header: &Option<(String, usize)>| -> Vec<(&'static str, MetadataValue)> {
                header
                    .as_ref()
                    .map(|(title, level)| {
                        vec![
                            ("section_header", MetadataValue::from(title.as_str())),
                            ("section_level", MetadataValue::from(*level)),
                        ]
                    })
                    .unwrap_or_default()
            };

            let slice = &text[range.clone()];
            if self.counter.count(slice) <= self.max_tokens {
                sink.push(range, tags(&section.header));
                continue;
            }

            for span in split_spans(slice, self.max_tokens, self.overlap, self.counter.as_ref()) {
                sink.push(
                    range.start + span.start..range.start + span.end,
                    tags(&section.header),
                );
            }
        }

        let chunks = sink.finish();
        tracing::debug!(chunks = chunks.len(), "chunked document");
        Ok(chunks)
    }

    fn name(&self) -> &'static str {
        "structure_aware"
    }
}
