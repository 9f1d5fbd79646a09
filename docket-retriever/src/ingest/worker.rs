//! Worker pool that drains the task queue through the ingestion pipeline.

use super::pipeline::{IngestionOutcome, IngestionPipeline, JobContext};
use super::task_queue::{JobLease, RetryDecision, TaskQueue};
use crate::error::{DispatchError, PipelineError};
use crate::storage::DocumentRegistry;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long an idle worker sleeps before polling again.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Outcome counts across one or more workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub indexed: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.indexed += other.indexed;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    pipeline: Arc<IngestionPipeline>,
    registry: Arc<dyn DocumentRegistry>,
    workers: usize,
    stop: CancellationToken,
}

/// Handle on workers running in the background.
pub struct RunningPool {
    handles: Vec<JoinHandle<WorkerStats>>,
    stop: CancellationToken,
}

impl RunningPool {
    /// Ask the workers to stop after their current job and wait for them.
    pub async fn stop(self) -> WorkerStats {
        self.stop.cancel();
        join_all(self.handles).await
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        pipeline: Arc<IngestionPipeline>,
        registry: Arc<dyn DocumentRegistry>,
        workers: usize,
    ) -> Self {
        Self {
            queue,
            pipeline,
            registry,
            workers: workers.max(1),
            stop: CancellationToken::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run workers until no job is queued or running, including jobs waiting
    /// out a retry backoff.
    pub async fn run_until_idle(&self) -> WorkerStats {
        info!("Running {} workers until the queue is drained", self.workers);
        let handles = (0..self.workers)
            .map(|id| self.spawn_worker(id, true, self.stop.child_token()))
            .collect();
        let stats = join_all(handles).await;
        info!(
            "Queue drained: {} indexed, {} skipped, {} retried, {} failed, {} cancelled",
            stats.indexed, stats.skipped, stats.retried, stats.failed, stats.cancelled
        );
        stats
    }

    /// Start workers that keep polling until stopped.
    pub fn start(&self) -> RunningPool {
        let stop = self.stop.child_token();
        let handles = (0..self.workers)
            .map(|id| self.spawn_worker(id, false, stop.clone()))
            .collect();
        info!("Started {} ingestion workers", self.workers);
        RunningPool { handles, stop }
    }

    /// Stop every worker started from this pool.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    fn spawn_worker(
        &self,
        id: usize,
        until_idle: bool,
        stop: CancellationToken,
    ) -> JoinHandle<WorkerStats> {
        let pool = self.clone();
        tokio::spawn(async move { pool.worker_loop(id, until_idle, stop).await })
    }

    async fn worker_loop(&self, id: usize, until_idle: bool, stop: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        debug!("Worker {} started", id);

        loop {
            if stop.is_cancelled() {
                break;
            }
            if until_idle && self.queue.is_idle().await {
                break;
            }

            let lease = tokio::select! {
                lease = self.queue.claim_wait(IDLE_POLL) => lease,
                _ = stop.cancelled() => None,
            };
            match lease {
                Some(lease) => stats += self.handle(lease).await,
                None if self.queue.is_shutdown().await => break,
                None => {}
            }
        }

        debug!("Worker {} finished", id);
        stats
    }

    /// Run one delivery and report its outcome to the queue.
    pub async fn handle(&self, lease: JobLease) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let job = JobContext::new(&lease.document_id, lease.kind).with_cancel(lease.cancel.clone());

        let reported = match self.pipeline.run(&job).await {
            Ok(IngestionOutcome::Indexed { .. }) => {
                stats.indexed += 1;
                self.queue.ack(&lease).await
            }
            Ok(IngestionOutcome::AlreadyIndexed) => {
                stats.skipped += 1;
                self.queue.ack(&lease).await
            }
            Ok(IngestionOutcome::Duplicate) => {
                stats.skipped += 1;
                self.queue.discard(&lease).await
            }
            Err(e @ PipelineError::Cancelled) => {
                stats.cancelled += 1;
                self.queue.fail(&lease, e.to_string()).await
            }
            Err(e) if e.is_retryable() => self.retry(&lease, &e, &mut stats).await,
            Err(e) => {
                stats.failed += 1;
                self.queue.fail(&lease, e.to_string()).await
            }
        };

        if let Err(e) = reported {
            log_report_error(&lease, &e);
        }
        stats
    }

    async fn retry(
        &self,
        lease: &JobLease,
        cause: &PipelineError,
        stats: &mut WorkerStats,
    ) -> Result<(), DispatchError> {
        match self.queue.retry(lease, cause.kind().as_str()).await? {
            RetryDecision::Scheduled { .. } => stats.retried += 1,
            RetryDecision::Exhausted => {
                stats.failed += 1;
                match self.registry.mark_terminal(&lease.document_id).await {
                    Ok(true) => info!(
                        "Document {} failed terminally after {} attempts",
                        lease.document_id, lease.attempt
                    ),
                    Ok(false) => debug!(
                        "Document {} was not FAILED when retries ran out",
                        lease.document_id
                    ),
                    Err(e) => error!(
                        "Could not mark document {} terminal: {}",
                        lease.document_id, e
                    ),
                }
            }
        }
        Ok(())
    }
}

fn log_report_error(lease: &JobLease, e: &DispatchError) {
    match e {
        DispatchError::StaleLease(_) => warn!(
            "Job {} finished after its lease expired; outcome left to the redelivery",
            lease.job_id
        ),
        other => error!("Could not report outcome of job {}: {}", lease.job_id, other),
    }
}

async fn join_all(handles: Vec<JoinHandle<WorkerStats>>) -> WorkerStats {
    let mut total = WorkerStats::default();
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(stats) => total += stats,
            Err(e) => error!("Worker task failed: {}", e),
        }
    }
    total
}
