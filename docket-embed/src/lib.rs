//! # docket-embed
//!
//! Text embedding providers behind a single async trait. Vectors are stored as
//! half-precision (`f16`) to keep the index small.
//!
//! Two backends are available:
//!
//! - **hash**: deterministic feature hashing, no model files, suited to local
//!   runs and tests
//! - **fastembed**: local ONNX models from the fastembed catalogue, loaded once
//!   per process and cached
//!
//! ```no_run
//! use docket_embed::{EmbedConfig, create_provider};
//!
//! # async fn example() -> docket_embed::Result<()> {
//! let provider = create_provider(&EmbedConfig::hash(384)).await?;
//! let result = provider
//!     .embed_texts(&["Hello world".to_string(), "How are you?".to_string()])
//!     .await?;
//! assert_eq!(result.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! Every call is atomic: a provider either returns one vector per input, in
//! input order, or an [`EmbedError`]. Use [`EmbedError::is_transient`] to decide
//! whether a failed batch is worth retrying.

pub mod config;
pub mod error;
pub mod hash;
pub mod provider;

pub use config::{EmbedConfig, ProviderKind};
pub use error::{EmbedError, Result};
pub use hash::HashEmbedProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider, create_provider};
