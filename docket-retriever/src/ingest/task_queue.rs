//! In-process job queue with leases and retry backoff.
//!
//! Delivery is at-least-once: a claimed job is held under a lease, and a lease
//! that expires before the worker reports back puts the job back on the queue
//! for another worker. Workers must therefore tolerate duplicate deliveries; the
//! registry claim is what keeps two deliveries from both doing the work.

use crate::config::JobSettings;
use crate::error::DispatchError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finished jobs kept for status queries before the oldest are forgotten.
const FINISHED_RETENTION: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Ingest,
    /// Drop the existing vectors and index the document again
    Reindex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// A duplicate delivery found the document already claimed
    Discarded,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Snapshot of a job for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub document_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Deliveries so far
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A claimed job. Report the outcome with `ack`, `retry`, `fail` or `discard`.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub job_id: JobId,
    pub document_id: String,
    pub kind: JobKind,
    /// 1 for the first delivery
    pub attempt: u32,
    pub cancel: CancellationToken,
    token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { retry: u32, delay: Duration },
    /// `max_retries` reached; the job is now FAILED
    Exhausted,
}

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    not_before: Instant,
    lease: Option<(u64, Instant)>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    ready: VecDeque<JobId>,
    finished: VecDeque<JobId>,
    next_id: u64,
    next_token: u64,
    shutdown: bool,
}

impl State {
    fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|e| e.record.status.is_active())
            .count()
    }

    fn finish(&mut self, id: JobId) {
        self.finished.push_back(id);
        while self.finished.len() > FINISHED_RETENTION {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }

    /// Return expired leases to the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, e)| {
                e.record.status == JobStatus::Running
                    && e.lease.is_some_and(|(_, expires)| expires <= now)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.jobs.get_mut(&id) {
                warn!(
                    "Lease expired for job {} (document {}); redelivering",
                    id, entry.record.document_id
                );
                entry.record.status = JobStatus::Queued;
                entry.lease = None;
                entry.not_before = now;
                self.ready.push_back(id);
            }
        }
    }

    fn leased_entry(&mut self, lease: &JobLease) -> Result<&mut Entry, DispatchError> {
        let entry = self
            .jobs
            .get_mut(&lease.job_id)
            .ok_or(DispatchError::UnknownJob(lease.job_id.0))?;
        let current = entry.lease.map(|(token, _)| token) == Some(lease.token);
        // The original holder may still report once a duplicate delivery was discarded
        if current || entry.record.status == JobStatus::Discarded {
            Ok(entry)
        } else {
            Err(DispatchError::StaleLease(lease.job_id.0))
        }
    }
}

/// Job queue shared by the intake service and the worker pool.
#[derive(Debug)]
pub struct TaskQueue {
    settings: JobSettings,
    state: Mutex<State>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(settings: JobSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State {
                next_id: 1,
                next_token: 1,
                ..State::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Queue a job for a document. An active job for the same document is
    /// returned instead of creating another.
    pub async fn enqueue(&self, document_id: &str, kind: JobKind) -> Result<JobId, DispatchError> {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return Err(DispatchError::Shutdown);
        }

        if let Some(existing) = state
            .jobs
            .values()
            .find(|e| e.record.document_id == document_id && e.record.status.is_active())
        {
            debug!(
                "Document {} already has active job {}",
                document_id, existing.record.id
            );
            return Ok(existing.record.id);
        }

        if state.active_count() >= self.settings.max_queue_size {
            warn!("Job queue is full, rejecting document {}", document_id);
            return Err(DispatchError::QueueFull {
                capacity: self.settings.max_queue_size,
            });
        }

        let id = JobId(state.next_id);
        state.next_id += 1;
        state.jobs.insert(
            id,
            Entry {
                record: JobRecord {
                    id,
                    document_id: document_id.to_string(),
                    kind,
                    status: JobStatus::Queued,
                    attempts: 0,
                    enqueued_at: Utc::now(),
                    last_error: None,
                },
                not_before: Instant::now(),
                lease: None,
                cancel: CancellationToken::new(),
            },
        );
        state.ready.push_back(id);
        drop(state);

        info!("Enqueued {:?} job {} for document {}", kind, id, document_id);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Hand out the next job whose backoff has elapsed.
    pub async fn claim(&self) -> Option<JobLease> {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return None;
        }
        let now = Instant::now();
        state.reclaim_expired(now);

        let position = state.ready.iter().position(|id| {
            state
                .jobs
                .get(id)
                .is_some_and(|e| e.record.status == JobStatus::Queued && e.not_before <= now)
        })?;
        let id = state.ready.remove(position)?;

        let token = state.next_token;
        state.next_token += 1;
        let lease_expiry = now + self.settings.lease();

        let entry = state.jobs.get_mut(&id)?;
        entry.record.status = JobStatus::Running;
        entry.record.attempts += 1;
        entry.lease = Some((token, lease_expiry));

        debug!(
            "Claimed job {} for document {} (attempt {})",
            id, entry.record.document_id, entry.record.attempts
        );
        Some(JobLease {
            job_id: id,
            document_id: entry.record.document_id.clone(),
            kind: entry.record.kind,
            attempt: entry.record.attempts,
            cancel: entry.cancel.clone(),
            token,
        })
    }

    /// Wait for `claim` to succeed, up to `timeout`.
    pub async fn claim_wait(&self, timeout: Duration) -> Option<JobLease> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(lease) = self.claim().await {
                return Some(lease);
            }
            let now = Instant::now();
            if now >= deadline || self.is_shutdown().await {
                return None;
            }
            let wake_at = match self.next_ready_at().await {
                Some(at) if at < deadline => at.max(now),
                _ => deadline,
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub async fn ack(&self, lease: &JobLease) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_entry(lease)?;
        entry.record.status = JobStatus::Succeeded;
        entry.record.last_error = None;
        entry.lease = None;
        state.finish(lease.job_id);
        drop(state);

        debug!("Job {} succeeded", lease.job_id);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Requeue after `base * 2^(attempt-1)`, or fail the job once `max_retries`
    /// retries have been used.
    pub async fn retry(
        &self,
        lease: &JobLease,
        error: impl Into<String>,
    ) -> Result<RetryDecision, DispatchError> {
        let error = error.into();
        let mut state = self.state.lock().await;
        let entry = state.leased_entry(lease)?;
        entry.lease = None;
        entry.record.last_error = Some(error.clone());

        let retries_used = entry.record.attempts.saturating_sub(1);
        let decision = if retries_used < self.settings.max_retries {
            let retry = retries_used + 1;
            let delay = self.settings.backoff(retry);
            entry.record.status = JobStatus::Queued;
            entry.not_before = Instant::now() + delay;
            state.ready.push_back(lease.job_id);
            info!(
                "Job {} will retry ({}/{}) in {:?}: {}",
                lease.job_id, retry, self.settings.max_retries, delay, error
            );
            RetryDecision::Scheduled { retry, delay }
        } else {
            entry.record.status = JobStatus::Failed;
            state.finish(lease.job_id);
            warn!(
                "Job {} exhausted {} retries: {}",
                lease.job_id, self.settings.max_retries, error
            );
            RetryDecision::Exhausted
        };
        drop(state);

        self.notify.notify_waiters();
        Ok(decision)
    }

    /// Terminal failure. A job whose cancellation was requested ends CANCELLED.
    pub async fn fail(&self, lease: &JobLease, error: impl Into<String>) -> Result<(), DispatchError> {
        let error = error.into();
        let mut state = self.state.lock().await;
        let entry = state.leased_entry(lease)?;
        entry.lease = None;
        entry.record.status = if entry.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        entry.record.last_error = Some(error.clone());
        state.finish(lease.job_id);
        drop(state);

        warn!("Job {} failed: {}", lease.job_id, error);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Drop a duplicate delivery without recording an outcome for the document.
    pub async fn discard(&self, lease: &JobLease) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_entry(lease)?;
        entry.lease = None;
        entry.record.status = JobStatus::Discarded;
        state.finish(lease.job_id);
        drop(state);

        debug!("Job {} discarded as duplicate delivery", lease.job_id);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Cancel a job. Queued jobs are dropped; running jobs are signalled and
    /// stop at their next checkpoint.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, DispatchError> {
        let mut state = self.state.lock().await;
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(DispatchError::UnknownJob(job_id.0))?;

        let current = entry.record.status;
        let status = match current {
            JobStatus::Queued => {
                entry.record.status = JobStatus::Cancelled;
                entry.cancel.cancel();
                state.ready.retain(|id| *id != job_id);
                state.finish(job_id);
                info!("Cancelled queued job {}", job_id);
                JobStatus::Cancelled
            }
            JobStatus::Running => {
                entry.cancel.cancel();
                info!("Cancellation requested for running job {}", job_id);
                JobStatus::Running
            }
            finished => finished,
        };
        drop(state);

        self.notify.notify_waiters();
        Ok(status)
    }

    pub async fn status(&self, job_id: JobId) -> Option<JobRecord> {
        let state = self.state.lock().await;
        state.jobs.get(&job_id).map(|e| e.record.clone())
    }

    pub async fn jobs_for(&self, document_id: &str) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|e| e.record.document_id == document_id)
            .map(|e| e.record.clone())
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Jobs waiting to be claimed, including those in backoff.
    pub async fn queue_size(&self) -> usize {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .filter(|e| e.record.status == JobStatus::Queued)
            .count()
    }

    /// No job is queued or running.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.active_count() == 0
    }

    async fn next_ready_at(&self) -> Option<Instant> {
        let state = self.state.lock().await;
        let lease_expiries = state.jobs.values().filter_map(|e| match e.record.status {
            JobStatus::Running => e.lease.map(|(_, expires)| expires),
            _ => None,
        });
        state
            .jobs
            .values()
            .filter(|e| e.record.status == JobStatus::Queued)
            .map(|e| e.not_before)
            .chain(lease_expiries)
            .min()
    }

    /// Stop handing out jobs. Running jobs finish normally.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.notify.notify_waiters();
        debug!("Task queue shut down");
    }

    pub async fn is_shutdown(&self) -> bool {
        self.state.lock().await.shutdown
    }
}
