//! Directory ingestion helpers and progress reporting.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Extensions read as plain text by directory ingestion. Other formats need upstream extraction.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

/// Progress update during directory ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestProgress {
    /// Files finished so far, successfully or not.
    pub processed: usize,
    /// Total files discovered.
    pub total: usize,
    /// File being processed, if any.
    pub current_file: Option<PathBuf>,
    /// What is happening now.
    pub stage: IngestStage,
}

impl IngestProgress {
    /// Creates a new progress update.
    #[must_use]
    pub const fn new(
        processed: usize,
        total: usize,
        current_file: Option<PathBuf>,
        stage: IngestStage,
    ) -> Self {
        Self {
            processed,
            total,
            current_file,
            stage,
        }
    }
}

/// Stages of directory ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStage {
    /// Walking the directory tree.
    Scanning,
    /// Cleaning, chunking, embedding and indexing the current file.
    Ingesting,
    /// The file was ingested.
    Ingested {
        /// Chunks written to the index.
        indexed: usize,
        /// Chunks dropped as duplicates.
        duplicates: usize,
    },
    /// The file was skipped.
    Skipped {
        /// Why.
        reason: String,
    },
    /// Every file has been handled.
    Done,
}

/// Collects plain-text files under `root`, sorted by path.
///
/// Unreadable entries are skipped.
///
/// # Errors
/// Returns an error if `root` itself cannot be read.
pub fn collect_text_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    let mut files = Vec::new();
    let mut first = true;

    while let Some(path) = stack.pop() {
        let metadata = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if first => return Err(e.into()),
            Err(_) => continue,
        };
        first = false;

        if metadata.is_dir() {
            let Ok(entries) = fs::read_dir(&path) else {
                continue;
            };
            stack.extend(entries.flatten().map(|entry| entry.path()));
        } else if metadata.is_file() && is_text_file(&path) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            TEXT_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Document id for a file: its path relative to `root`, with `/` separators.
#[must_use]
pub fn document_id_for(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
