//! # relay
//!
//! Facade crate that re-exports [`relay_core`] and, with the default `rag` feature, the whole of
//! [`relay_rag`]: chunking, hybrid vector/BM25 retrieval, and confidence-scored escalation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay::rag::{IngestDocument, KnowledgeBase, RagConfig};
//!
//! # async fn demo(model: impl relay::EmbeddingModel) -> relay::rag::Result<()> {
//! let kb = KnowledgeBase::open(Arc::new(model), RagConfig::default())?;
//! kb.ingest(IngestDocument::new("hours", "Support is open 9 to 5, Monday to Friday.")).await?;
//!
//! let hits = kb.retrieve("when is support open?", None).await;
//! let confidence = kb.score("Support is open 9 to 5 on weekdays.", &hits, "when is support open?");
//! if confidence.should_escalate {
//!     println!("routing to a human agent");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `rag` (default): re-exports `relay-rag` as [`rag`].
//! - `hf-tokenizer`: exact token counting with a `HuggingFace` tokenizer.

pub use relay_core::*;

#[cfg(feature = "rag")]
#[doc(inline)]
pub use relay_rag as rag;
