//! docket-retriever: asynchronous document ingestion and passage retrieval
//!
//! Uploaded documents are registered, queued, and indexed in the background by
//! a worker pool: text is extracted, split into overlapping chunks, embedded,
//! and written to a per-owner vector collection. Queries embed the question,
//! search the owner's collection and return ranked, deduplicated passages.
//!
//! ## Key Modules
//!
//! - **[`service`]**: [`DocketService`], the intake facade used by the CLI
//! - **[`ingest`]**: task queue, ingestion pipeline and worker pool
//! - **[`retrieval`]**: query engine
//! - **[`storage`]**: document registry, vector index and content store
//! - **[`status`]**: status, summary and health views
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docket_retriever::{DocketConfig, DocketService};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = DocketService::open(DocketConfig::default()).await?;
//! let receipt = service.upload("alice", "notes.txt", b"The sky is blue.").await?;
//! service.run_workers_until_idle().await;
//!
//! let result = service.query(&service.new_query("what colour is the sky", "alice")).await?;
//! println!("{}", result.to_context());
//! # let _ = receipt;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! upload → Registry (PENDING) → TaskQueue → Worker → IngestionPipeline
//!                                                     ↓
//!            ContentStore → Chunker → Embedder → VectorIndex → Registry (INDEXED)
//!
//! query → Embedder → VectorIndex (owner collection) → dedup → RetrievalResult
//! ```

pub mod config;
pub mod error;
pub mod ingest;
pub mod retrieval;
pub mod service;
pub mod status;
pub mod storage;

pub use config::DocketConfig;
pub use error::{ErrorKind, IntakeError, PipelineError};
pub use service::{DocketService, RecoveryReport, ServiceParts, UploadReceipt};
