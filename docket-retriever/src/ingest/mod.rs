//! Background ingestion: job queue, pipeline and worker pool.
//!
//! - **[`task_queue`]**: in-process queue with leases, retry backoff and cancellation
//! - **[`pipeline`]**: claim → extract → chunk → embed → upsert → complete for one document
//! - **[`worker`]**: tokio workers that drain the queue through the pipeline

pub mod pipeline;
pub mod task_queue;
pub mod worker;

pub use pipeline::{IngestionOutcome, IngestionPipeline, JobContext, PipelineConfig};
pub use task_queue::{JobId, JobKind, JobLease, JobRecord, JobStatus, RetryDecision, TaskQueue};
pub use worker::{RunningPool, WorkerPool, WorkerStats};
