//! Token counting strategies used to bound chunk sizes.

/// Counts tokens in a piece of text.
///
/// Chunkers never tokenize themselves; they ask a counter. Swapping the approximate counter for
/// an exact tokenizer changes chunk boundaries without touching the splitting logic.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> usize;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Character heuristic: one token per four characters, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    fn name(&self) -> &'static str {
        "approx"
    }
}

/// Counts whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

#[cfg(feature = "hf-tokenizer")]
pub use hf::HfTokenCounter;

#[cfg(feature = "hf-tokenizer")]
mod hf {
    use std::fmt;
    use std::path::Path;

    use tokenizers::Tokenizer;

    use super::{ApproxTokenCounter, TokenCounter};
    use crate::error::{RagError, Result};

    /// Exact counts from a HuggingFace tokenizer.
    ///
    /// Falls back to [`ApproxTokenCounter`] for inputs the tokenizer rejects.
    pub struct HfTokenCounter {
        tokenizer: Tokenizer,
    }

    impl HfTokenCounter {
        /// Wraps an already loaded tokenizer.
        #[must_use]
        pub const fn new(tokenizer: Tokenizer) -> Self {
            Self { tokenizer }
        }

        /// Loads a `tokenizer.json` file.
        ///
        /// # Errors
        /// Returns [`RagError::Config`] if the file cannot be parsed.
        pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            Tokenizer::from_file(path).map(Self::new).map_err(|e| {
                RagError::config(format!("failed to load tokenizer {}: {e}", path.display()))
            })
        }

        /// Parses tokenizer JSON from memory.
        ///
        /// # Errors
        /// Returns [`RagError::Config`] if the bytes are not a valid tokenizer.
        pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
            Tokenizer::from_bytes(bytes)
                .map(Self::new)
                .map_err(|e| RagError::config(format!("failed to parse tokenizer: {e}")))
        }
    }

    impl fmt::Debug for HfTokenCounter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("HfTokenCounter").finish_non_exhaustive()
        }
    }

    impl TokenCounter for HfTokenCounter {
        fn count(&self, text: &str) -> usize {
            match self.tokenizer.encode(text, false) {
                Ok(encoding) => encoding.len(),
                Err(error) => {
                    tracing::debug!(%error, "tokenizer rejected input, using approximation");
                    ApproxTokenCounter.count(text)
                }
            }
        }

        fn name(&self) -> &'static str {
            "huggingface"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_rounds_up() {
        assert_eq!(ApproxTokenCounter.count(""), 0);
        assert_eq!(ApproxTokenCounter.count("abc"), 1);
        assert_eq!(ApproxTokenCounter.count("abcd"), 1);
        assert_eq!(ApproxTokenCounter.count("abcde"), 2);
    }

    #[test]
    fn approx_counts_chars_not_bytes() {
        assert_eq!(ApproxTokenCounter.count("héhé"), 1);
    }

    #[test]
    fn whitespace_counts_words() {
        assert_eq!(WhitespaceTokenCounter.count("  one two\n\nthree "), 3);
        assert_eq!(WhitespaceTokenCounter.count("   "), 0);
    }
}
