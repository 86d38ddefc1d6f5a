//! Content deduplication using xxhash.

use std::collections::HashSet;

use xxhash_rust::xxh3::xxh3_64;

use crate::types::Chunk;

/// Computes a content hash for deduplication.
#[must_use]
pub fn content_hash(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

/// Chunks that survived deduplication, plus what was dropped.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Accepted chunks, in input order.
    pub chunks: Vec<Chunk>,
    /// Hashes of dropped chunks, in input order. May repeat.
    pub dropped_hashes: Vec<u64>,
}

impl DedupOutcome {
    /// Number of dropped chunks.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped_hashes.len()
    }
}

/// Remembers every accepted content hash and drops later chunks that repeat one.
///
/// Seed it with the hashes already live in an index to make re-ingestion idempotent: the second
/// pass over an unchanged document drops every chunk.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    seen: HashSet<u64>,
}

impl Deduplicator {
    /// Creates an empty deduplicator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a deduplicator that already knows `hashes`.
    #[must_use]
    pub fn with_known(hashes: impl IntoIterator<Item = u64>) -> Self {
        Self {
            seen: hashes.into_iter().collect(),
        }
    }

    /// Returns `true` if `hash` has been accepted before.
    #[must_use]
    pub fn contains(&self, hash: u64) -> bool {
        self.seen.contains(&hash)
    }

    /// Splits `chunks` into survivors and dropped hashes.
    pub fn filter(&mut self, chunks: impl IntoIterator<Item = Chunk>) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();
        for chunk in chunks {
            if self.seen.insert(chunk.content_hash) {
                outcome.chunks.push(chunk);
            } else {
                outcome.dropped_hashes.push(chunk.content_hash);
            }
        }
        outcome
    }
}

/// One-shot deduplication of a chunk sequence.
#[must_use]
pub fn deduplicate(chunks: Vec<Chunk>) -> DedupOutcome {
    Deduplicator::new().filter(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn chunk(seq: usize, text: &str) -> Chunk {
        Chunk::new("doc1", seq, text, 1, Metadata::new())
    }

    #[test]
    fn same_content_same_hash() {
        let text = "Hello, world!";
        assert_eq!(content_hash(text), content_hash(text));
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(content_hash("Hello, world!"), content_hash("Goodbye, world!"));
    }

    #[test]
    fn drops_repeats_within_one_pass() {
        let outcome = deduplicate(vec![chunk(0, "a"), chunk(1, "b"), chunk(2, "a")]);

        assert_eq!(outcome.chunks.len(), 2);
        assert_eq!(outcome.chunks[0].sequence_index, 0);
        assert_eq!(outcome.chunks[1].sequence_index, 1);
        assert_eq!(outcome.dropped_hashes, vec![content_hash("a")]);
    }

    #[test]
    fn second_pass_drops_everything() {
        let mut dedup = Deduplicator::new();
        let first = dedup.filter(vec![chunk(0, "a"), chunk(1, "b")]);
        let second = dedup.filter(vec![chunk(0, "a"), chunk(1, "b")]);

        assert_eq!(first.chunks.len(), 2);
        assert!(second.chunks.is_empty());
        assert_eq!(second.dropped(), 2);
    }

    #[test]
    fn seeded_hashes_count_as_seen() {
        let mut dedup = Deduplicator::with_known([content_hash("known")]);
        assert!(dedup.contains(content_hash("known")));

        let outcome = dedup.filter(vec![chunk(0, "known"), chunk(1, "new")]);
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.chunks[0].text, "new");
    }
}
