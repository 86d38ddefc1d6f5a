//! # relay-core
//!
//! `relay-core` hosts the `no_std` trait APIs shared by the rest of the workspace. The retrieval
//! crate only ever talks to an embedding provider through [`EmbeddingModel`], so swapping a hosted
//! API for a local model never touches chunking, indexing, or scoring code.
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   relay-rag     │───▶│   relay-core     │◀───│   Providers     │
//! │                 │    │  (this crate)    │    │                 │
//! │ - chunking      │    │                  │    │ - hosted APIs   │
//! │ - hybrid search │    │ - EmbeddingModel │    │ - local models  │
//! │ - confidence    │    │ - Result         │    │ - test doubles  │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use relay_core::EmbeddingModel;
//!
//! struct Constant;
//!
//! impl EmbeddingModel for Constant {
//!     fn dim(&self) -> usize {
//!         3
//!     }
//!
//!     async fn embed(&self, _text: &str) -> relay_core::Result<Vec<f32>> {
//!         Ok(vec![1.0, 0.0, 0.0])
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let vectors = Constant
//!     .embed_batch(&["a".to_string(), "b".to_string()])
//!     .await
//!     .unwrap();
//! assert_eq!(vectors.len(), 2);
//! # });
//! ```

#![no_std]
extern crate alloc;

/// Text embeddings.
pub mod embedding;

#[doc(inline)]
pub use embedding::{Embedding, EmbeddingModel};

/// Result type used throughout the crate.
///
/// Type alias for [`anyhow::Result<T>`](anyhow::Result) with `()` as default success type.
pub type Result<T = ()> = anyhow::Result<T>;

pub use anyhow::Error;
