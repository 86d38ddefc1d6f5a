//! Text cleaning executed before chunking.

use crate::types::IngestDocument;

/// Trait for document cleaning strategies.
pub trait Cleaner: Send + Sync {
    /// Cleans the input document and returns a normalized version.
    fn clean(&self, doc: &IngestDocument) -> IngestDocument;

    /// Returns the cleaner name.
    fn name(&self) -> &'static str;
}

/// Default cleaner applied before chunking.
///
/// It performs lightweight normalization:
/// - normalize line endings (`\r\n`, `\r` -> `\n`)
/// - trim trailing whitespace on each line
/// - collapse runs of blank lines to a single paragraph break
/// - trim outer whitespace
///
/// Markdown headers survive untouched, so structure-aware chunking still sees them.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCleaner;

impl BasicCleaner {
    fn normalize_line_endings(text: &str) -> String {
        text.replace("\r\n", "\n").replace('\r', "\n")
    }

    fn collapse_blank_lines(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut pending_break = false;

        for line in text.lines().map(str::trim_end) {
            if line.is_empty() {
                pending_break = !out.is_empty();
                continue;
            }
            if !out.is_empty() {
                out.push_str(if pending_break { "\n\n" } else { "\n" });
            }
            out.push_str(line);
            pending_break = false;
        }

        out
    }
}

impl Cleaner for BasicCleaner {
    fn clean(&self, doc: &IngestDocument) -> IngestDocument {
        let normalized = Self::normalize_line_endings(&doc.text);
        let collapsed = Self::collapse_blank_lines(&normalized);

        IngestDocument {
            document_id: doc.document_id.clone(),
            text: collapsed.trim().to_string(),
            metadata: doc.metadata.clone(),
        }
    }

    fn name(&self) -> &'static str {
        "basic"
    }
}

/// Leaves documents untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleaner;

impl Cleaner for NoopCleaner {
    fn clean(&self, doc: &IngestDocument) -> IngestDocument {
        doc.clone()
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_text() {
        let doc = IngestDocument::new("d1", "a\r\n\r\n\r\n b  \n\n\n\nc");
        let cleaned = BasicCleaner.clean(&doc);
        assert_eq!(cleaned.text, "a\n\n b\n\nc");
    }

    #[test]
    fn keeps_single_newlines_and_headers() {
        let doc = IngestDocument::new("d1", "# Title  \nline one\nline two\n\n\n## Next\r\nbody");
        let cleaned = BasicCleaner.clean(&doc);
        assert_eq!(cleaned.text, "# Title\nline one\nline two\n\n## Next\nbody");
    }

    #[test]
    fn whitespace_only_becomes_empty() {
        let doc = IngestDocument::new("d1", " \n\n\t\n");
        assert!(BasicCleaner.clean(&doc).text.is_empty());
    }

    #[test]
    fn noop_preserves_text() {
        let doc = IngestDocument::new("d1", "  raw\r\n").with("k", "v");
        let cleaned = NoopCleaner.clean(&doc);
        assert_eq!(cleaned.text, "  raw\r\n");
        assert_eq!(cleaned.metadata, doc.metadata);
    }
}
