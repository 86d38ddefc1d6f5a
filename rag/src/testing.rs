//! Deterministic embedders and storage shared by unit tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use relay_core::EmbeddingModel;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{RagError, Result};
use crate::persistence::{IndexSnapshot, Persistence};

/// Bag-of-words embedder: each lowercase word adds weight to a hashed bucket, and the result is
/// L2-normalized. Texts sharing words land close together.
#[derive(Clone, Debug)]
pub(crate) struct HashEmbedder {
    dimension: usize,
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl HashEmbedder {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every later call fail until switched back.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = usize::try_from(xxh3_64(word.to_lowercase().as_bytes()))
                .unwrap_or_default()
                % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl EmbeddingModel for HashEmbedder {
    fn dim(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> relay_core::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("embedding provider unavailable");
        }
        Ok(self.vector(text))
    }
}

/// Keeps the last saved snapshot in memory. Saves can be switched to fail.
#[derive(Clone, Debug, Default)]
pub(crate) struct MemoryPersistence {
    saved: Arc<Mutex<Option<IndexSnapshot>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPersistence {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn saved(&self) -> Option<IndexSnapshot> {
        self.saved.lock().clone()
    }
}

impl Persistence for MemoryPersistence {
    fn save(&self, snapshot: &IndexSnapshot) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RagError::Io(std::io::Error::other("disk full")));
        }
        *self.saved.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<IndexSnapshot>> {
        Ok(self.saved())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn path(&self) -> &Path {
        Path::new("")
    }
}
