//! Intake service: the entry point for uploads, status, queries and deletes.
//!
//! [`DocketService`] owns explicitly passed handles to the registry, vector
//! index, content store and embedder, and wires them into the task queue,
//! worker pool and retrieval engine. Uploads return as soon as the document is
//! registered and queued; indexing happens on the workers.

use crate::config::DocketConfig;
use crate::error::{ErrorKind, IntakeError, RegistryError};
use crate::ingest::{
    IngestionPipeline, JobId, JobKind, JobStatus, RunningPool, TaskQueue, WorkerPool, WorkerStats,
};
use crate::retrieval::{RetrievalEngine, RetrievalQuery, RetrievalResult};
use crate::status::{DocumentStatusView, HealthReport, HealthStatus, OwnerSummary};
use crate::storage::{
    content_hash, document_id, file_extension, ClaimMode, Document, DocumentRegistry,
    DocumentStatus, FailureRecord, FsContentStore, SqliteRegistry, SqliteVectorIndex, VectorIndex,
};
use docket_embed::{create_provider, EmbeddingProvider};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Returned by [`DocketService::upload`].
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub document_id: String,
    pub status: DocumentStatus,
    /// Job that will index the document, if one is queued
    pub job_id: Option<JobId>,
    /// The owner had already uploaded these bytes
    pub duplicate: bool,
}

/// What [`DocketService::recover`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// PROCESSING documents failed as interrupted
    pub interrupted: usize,
    /// Documents given a new job
    pub requeued: usize,
}

/// Storage and model handles the service is built from.
pub struct ServiceParts {
    pub registry: Arc<dyn DocumentRegistry>,
    pub index: Arc<dyn VectorIndex>,
    pub content: Arc<FsContentStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

pub struct DocketService {
    config: DocketConfig,
    registry: Arc<dyn DocumentRegistry>,
    index: Arc<dyn VectorIndex>,
    content: Arc<FsContentStore>,
    queue: Arc<TaskQueue>,
    workers: WorkerPool,
    retrieval: RetrievalEngine,
}

impl DocketService {
    /// Open the on-disk stores under `storage.data_dir` and the configured embedder.
    pub async fn open(config: DocketConfig) -> Result<Self, IntakeError> {
        config.validate()?;
        let storage = &config.storage;
        info!("Opening docket data in {}", storage.data_dir.display());

        let registry = Arc::new(SqliteRegistry::open(&storage.registry_path()).await?);
        let index = Arc::new(SqliteVectorIndex::open(&storage.vectors_path()).await?);
        let content = Arc::new(FsContentStore::open(storage.blobs_dir()).await?);
        let embedder = create_provider(&config.embedding).await?;

        Self::from_parts(
            config,
            ServiceParts {
                registry,
                index,
                content,
                embedder,
            },
        )
    }

    /// In-memory registry and index; content still goes to `storage.data_dir`.
    pub async fn open_in_memory(config: DocketConfig) -> Result<Self, IntakeError> {
        config.validate()?;
        let registry = Arc::new(SqliteRegistry::open_memory().await?);
        let index = Arc::new(SqliteVectorIndex::open_memory().await?);
        let content = Arc::new(FsContentStore::open(config.storage.blobs_dir()).await?);
        let embedder = create_provider(&config.embedding).await?;

        Self::from_parts(
            config,
            ServiceParts {
                registry,
                index,
                content,
                embedder,
            },
        )
    }

    pub fn from_parts(config: DocketConfig, parts: ServiceParts) -> Result<Self, IntakeError> {
        config.validate()?;
        let pipeline = IngestionPipeline::from_config(
            &config,
            parts.registry.clone(),
            parts.index.clone(),
            parts.content.clone(),
            parts.embedder.clone(),
        )?;
        let queue = Arc::new(TaskQueue::new(config.jobs.clone()));
        let workers = WorkerPool::new(
            queue.clone(),
            Arc::new(pipeline),
            parts.registry.clone(),
            config.jobs.workers,
        );
        let retrieval = RetrievalEngine::from_config(
            &config,
            parts.registry.clone(),
            parts.index.clone(),
            parts.embedder,
        );

        Ok(Self {
            config,
            registry: parts.registry,
            index: parts.index,
            content: parts.content,
            queue,
            workers,
            retrieval,
        })
    }

    pub fn config(&self) -> &DocketConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<dyn DocumentRegistry> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Accept a document for asynchronous indexing.
    pub async fn upload(
        &self,
        owner: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<UploadReceipt, IntakeError> {
        if owner.trim().is_empty() {
            return Err(IntakeError::MissingOwner);
        }
        if bytes.is_empty() {
            return Err(IntakeError::Empty);
        }
        let max = self.config.intake.max_file_size;
        if bytes.len() > max {
            return Err(IntakeError::TooLarge {
                size: bytes.len(),
                max,
            });
        }
        let extension = file_extension(filename);
        if !self.config.intake.allows(&extension) {
            return Err(IntakeError::UnsupportedType { extension });
        }

        // Bytes go in first so a registered document always has content
        let hash = content_hash(bytes);
        self.content.put(&document_id(owner, &hash), bytes).await?;

        let registration = match self
            .registry
            .register(owner, &hash, filename, bytes.len() as u64)
            .await
        {
            Ok(registration) => registration,
            Err(RegistryError::DuplicateContent { existing }) => {
                let existing = *existing;
                info!(
                    "{} re-uploaded indexed document {} ({})",
                    owner, existing.id, filename
                );
                return Ok(UploadReceipt {
                    document_id: existing.id,
                    status: existing.status,
                    job_id: None,
                    duplicate: true,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let duplicate = !registration.is_new();
        let document = registration.into_document();

        let job_id = match document.status {
            DocumentStatus::Pending | DocumentStatus::Failed => {
                Some(self.queue.enqueue(&document.id, JobKind::Ingest).await?)
            }
            DocumentStatus::Processing | DocumentStatus::Indexed => None,
        };

        info!(
            "Accepted {} from {} as document {} ({}, job {:?})",
            filename, owner, document.id, document.status, job_id
        );
        Ok(UploadReceipt {
            document_id: document.id,
            status: document.status,
            job_id,
            duplicate,
        })
    }

    pub async fn status(&self, document_id: &str) -> Result<DocumentStatusView, IntakeError> {
        let document = self.lookup(document_id).await?;
        let jobs = self.queue.jobs_for(document_id).await;
        Ok(DocumentStatusView::new(document, jobs))
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<Document>, IntakeError> {
        Ok(self.registry.list(owner).await?)
    }

    /// A query for `owner` using the configured `top_k`.
    pub fn new_query(&self, text: impl Into<String>, owner: impl Into<String>) -> RetrievalQuery {
        RetrievalQuery::new(text, owner, self.config.retrieval.top_k)
    }

    pub async fn query(&self, query: &RetrievalQuery) -> Result<RetrievalResult, IntakeError> {
        Ok(self.retrieval.retrieve(query).await?)
    }

    /// Queue a document for reindexing.
    pub async fn reindex(&self, document_id: &str, owner: &str) -> Result<JobId, IntakeError> {
        let document = self.owned(document_id, owner).await?;
        if document.status == DocumentStatus::Processing {
            return Err(IntakeError::Busy {
                id: document.id,
            });
        }
        Ok(self.queue.enqueue(&document.id, JobKind::Reindex).await?)
    }

    /// Cancel a job. A queued ingestion never starts and its document ends
    /// FAILED with a terminal `Cancelled` error, the same as a running job
    /// stopped at a checkpoint. A queued reindex leaves the document as is.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, IntakeError> {
        let before = self.queue.status(job_id).await;
        let status = self.queue.cancel(job_id).await?;

        if let Some(job) = before {
            if job.status == JobStatus::Queued
                && status == JobStatus::Cancelled
                && job.kind == JobKind::Ingest
            {
                self.fail_cancelled(&job.document_id).await?;
            }
        }
        Ok(status)
    }

    /// Move a document whose ingestion was cancelled before it started to
    /// FAILED. Documents can only fail from PROCESSING, so this claims first.
    async fn fail_cancelled(&self, document_id: &str) -> Result<(), IntakeError> {
        match self.registry.claim(document_id, ClaimMode::Ingest).await {
            Ok(_) => {
                let failure = FailureRecord::new(
                    ErrorKind::Cancelled,
                    "job cancelled before it started",
                    true,
                );
                self.registry.fail(document_id, &failure).await?;
                info!("Document {} failed: ingestion cancelled", document_id);
                Ok(())
            }
            Err(RegistryError::AlreadyInFlight { .. })
            | Err(RegistryError::InvalidTransition { .. })
            | Err(RegistryError::NotFound { .. }) => {
                debug!(
                    "Document {} changed state before the cancellation was recorded",
                    document_id
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a document with its vectors, chunk records and stored bytes.
    pub async fn delete(&self, document_id: &str, owner: &str) -> Result<(), IntakeError> {
        let document = self.owned(document_id, owner).await?;
        if document.status == DocumentStatus::Processing {
            return Err(IntakeError::Busy {
                id: document.id,
            });
        }

        for job in self.queue.jobs_for(&document.id).await {
            if job.status.is_active() {
                self.queue.cancel(job.id).await?;
            }
        }

        let chunk_ids: Vec<String> = self
            .registry
            .chunks(&document.id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let removed = if chunk_ids.is_empty() {
            0
        } else {
            self.index.delete(&document.collection(), &chunk_ids).await?
        };
        self.registry.delete(&document.id).await?;
        self.content.remove(&document.id).await?;

        info!(
            "Deleted document {} ({}) and {} vectors",
            document.id, document.filename, removed
        );
        Ok(())
    }

    /// Delete every document of `owner` that is not being processed. Returns
    /// the number deleted.
    pub async fn delete_owner(&self, owner: &str) -> Result<usize, IntakeError> {
        let mut deleted = 0;
        for document in self.registry.list(owner).await? {
            match self.delete(&document.id, owner).await {
                Ok(()) => deleted += 1,
                Err(IntakeError::Busy { id }) => {
                    warn!("Skipping document {} while it is being processed", id)
                }
                Err(e) => return Err(e),
            }
        }
        info!("Deleted {} documents for {}", deleted, owner);
        Ok(deleted)
    }

    pub async fn summary(&self, owner: &str) -> Result<OwnerSummary, IntakeError> {
        let stats = self.registry.stats(Some(owner)).await?;
        Ok(OwnerSummary::new(owner, stats))
    }

    pub async fn health(&self) -> HealthReport {
        let registry = self.registry.health().await;
        let index = self.index.health().await;
        let vector_count = match &index {
            Ok(()) => self.index.count(None).await.ok(),
            Err(_) => None,
        };
        let overall_status = if registry.is_ok() && index.is_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Critical
        };

        HealthReport {
            registry_connected: registry.is_ok(),
            registry_error: registry.err().map(|e| e.to_string()),
            index_connected: index.is_ok(),
            index_error: index.err().map(|e| e.to_string()),
            vector_count,
            queue_size: self.queue.queue_size().await,
            overall_status,
        }
    }

    /// Startup sweep for a fresh queue. Documents left PROCESSING by a worker
    /// that died are failed as interrupted, then every PENDING or retryable
    /// FAILED document is queued. Only call this while no worker is running.
    pub async fn recover(&self) -> Result<RecoveryReport, IntakeError> {
        let mut report = RecoveryReport::default();

        for document in self.registry.with_status(DocumentStatus::Processing).await? {
            let failure = FailureRecord::new(
                ErrorKind::Interrupted,
                "processing stopped before the document was indexed",
                false,
            );
            self.registry.fail(&document.id, &failure).await?;
            report.interrupted += 1;
        }

        let pending = self.registry.with_status(DocumentStatus::Pending).await?;
        let failed = self.registry.with_status(DocumentStatus::Failed).await?;
        let retryable = failed
            .into_iter()
            .filter(|d| d.last_error.as_ref().is_none_or(|e| !e.terminal));
        for document in pending.into_iter().chain(retryable) {
            self.queue.enqueue(&document.id, JobKind::Ingest).await?;
            report.requeued += 1;
        }

        if report.interrupted > 0 || report.requeued > 0 {
            info!(
                "Recovered {} interrupted documents, queued {}",
                report.interrupted, report.requeued
            );
        }
        Ok(report)
    }

    /// Drain the queue with the configured number of workers.
    pub async fn run_workers_until_idle(&self) -> WorkerStats {
        self.workers.run_until_idle().await
    }

    /// Start background workers.
    pub fn start_workers(&self) -> RunningPool {
        self.workers.start()
    }

    /// Stop accepting jobs and stop workers. The stores close when the
    /// service is dropped.
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
        self.workers.shutdown();
        info!("Docket service shut down");
    }

    async fn lookup(&self, document_id: &str) -> Result<Document, IntakeError> {
        match self.registry.get(document_id).await {
            Ok(document) => Ok(document),
            Err(RegistryError::NotFound { id }) => Err(IntakeError::NotFound { id }),
            Err(e) => Err(e.into()),
        }
    }

    async fn owned(&self, document_id: &str, owner: &str) -> Result<Document, IntakeError> {
        let document = self.lookup(document_id).await?;
        if document.owner != owner {
            return Err(IntakeError::Forbidden {
                id: document.id,
            });
        }
        Ok(document)
    }
}
