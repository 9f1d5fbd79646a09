//! End-to-end ingestion and retrieval scenarios
//!
//! These run the real registry, vector index and content store (SQLite in
//! memory plus a temp directory) with the hash embedder, and wrap the index and
//! embedder in fault-injecting doubles to exercise failure handling:
//! - idempotent re-upload
//! - chunk coverage
//! - mutual exclusion between concurrent deliveries
//! - all-or-nothing indexing when embedding or indexing fails
//! - retries, terminal failure, cancellation and timeouts
//! - owner isolation at query time

use anyhow::Result;
use async_trait::async_trait;
use docket_embed::{EmbedError, EmbeddingProvider, EmbeddingResult, HashEmbedProvider};
use docket_retriever::error::{ErrorKind, IndexError};
use docket_retriever::ingest::{
    IngestionOutcome, IngestionPipeline, JobContext, JobKind, JobStatus, PipelineConfig,
};
use docket_retriever::storage::{
    DocumentRegistry, DocumentStatus, FsContentStore, SearchFilter, SearchHit, SqliteRegistry,
    SqliteVectorIndex, VectorIndex, VectorRecord,
};
use docket_retriever::{DocketConfig, DocketService, PipelineError, ServiceParts};
use half::f16;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const ALICE_TEXT: &str = "The sky is blue. Grass is green.";

/// Vector index that can be made unreachable or slow.
struct FlakyIndex {
    inner: SqliteVectorIndex,
    unreachable: AtomicBool,
    upsert_delay_ms: AtomicU64,
    upserts: AtomicUsize,
    /// Upserts are written but reported as failed
    lost_upsert_ack: AtomicBool,
    /// Deletes by chunk id fail
    chunk_deletes_fail: AtomicBool,
}

impl FlakyIndex {
    async fn new() -> Result<Self> {
        Ok(Self {
            inner: SqliteVectorIndex::open_memory().await?,
            unreachable: AtomicBool::new(false),
            upsert_delay_ms: AtomicU64::new(0),
            upserts: AtomicUsize::new(0),
            lost_upsert_ack: AtomicBool::new(false),
            chunk_deletes_fail: AtomicBool::new(false),
        })
    }

    fn check(&self) -> Result<(), IndexError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(IndexError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<(), IndexError> {
        self.check()?;
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(collection, records).await?;
        if self.lost_upsert_ack.load(Ordering::SeqCst) {
            return Err(IndexError::unavailable("connection reset after write"));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f16],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.check()?;
        self.inner.search(collection, query, top_k, filter).await
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, IndexError> {
        self.check()?;
        if self.chunk_deletes_fail.load(Ordering::SeqCst) {
            return Err(IndexError::unavailable("delete rejected"));
        }
        self.inner.delete(collection, ids).await
    }

    async fn delete_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.delete_document(collection, document_id).await
    }

    async fn count(&self, collection: Option<&str>) -> Result<usize, IndexError> {
        self.inner.count(collection).await
    }

    async fn health(&self) -> Result<(), IndexError> {
        self.check()
    }
}

/// Embedder whose calls start failing from the `fail_from`th call on.
struct FailingEmbedder {
    inner: HashEmbedProvider,
    calls: AtomicUsize,
    fail_from: usize,
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> docket_embed::Result<EmbeddingResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call >= self.fail_from {
            return Err(EmbedError::unavailable("model server unreachable"));
        }
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "failing"
    }
}

struct Harness {
    _dir: TempDir,
    config: DocketConfig,
    registry: Arc<SqliteRegistry>,
    index: Arc<FlakyIndex>,
    content: Arc<FsContentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    service: DocketService,
}

impl Harness {
    async fn new(configure: impl FnOnce(&mut DocketConfig)) -> Result<Self> {
        Self::with_embedder(configure, Arc::new(HashEmbedProvider::with_dimension(64)?)).await
    }

    async fn with_embedder(
        configure: impl FnOnce(&mut DocketConfig),
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = DocketConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.chunking.chunk_size = 20;
        config.chunking.chunk_overlap = 5;
        config.jobs.backoff_base_ms = 1;
        config.jobs.backoff_max_ms = 5;
        config.jobs.workers = 2;
        configure(&mut config);

        let registry = Arc::new(SqliteRegistry::open_memory().await?);
        let index = Arc::new(FlakyIndex::new().await?);
        let content = Arc::new(FsContentStore::open(config.storage.blobs_dir()).await?);
        let service = DocketService::from_parts(
            config.clone(),
            ServiceParts {
                registry: registry.clone(),
                index: index.clone(),
                content: content.clone(),
                embedder: embedder.clone(),
            },
        )?;

        Ok(Self {
            _dir: dir,
            config,
            registry,
            index,
            content,
            embedder,
            service,
        })
    }

    /// A pipeline over the same stores, for driving deliveries by hand.
    fn pipeline(&self, config: PipelineConfig) -> Result<IngestionPipeline> {
        let chunker = docket_context::Chunker::new(self.config.chunking.chunker_config())?;
        Ok(IngestionPipeline::new(
            self.registry.clone(),
            self.index.clone(),
            self.content.clone(),
            self.embedder.clone(),
            chunker,
            config,
        ))
    }

    async fn wait_for_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        for _ in 0..500 {
            if self.registry.get(document_id).await?.status == status {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        anyhow::bail!("document {document_id} never reached {status}")
    }
}

#[tokio::test]
async fn test_alice_document_ends_indexed_with_two_chunks() -> Result<()> {
    let h = Harness::new(|_| {}).await?;

    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    assert_eq!(receipt.status, DocumentStatus::Pending);

    let stats = h.service.run_workers_until_idle().await;
    assert_eq!(stats.indexed, 1);

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Indexed);
    assert_eq!(doc.chunk_count, 2);
    assert!(doc.last_error.is_none());
    assert_eq!(h.index.count(Some("owner:alice")).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_reupload_is_idempotent() -> Result<()> {
    let h = Harness::new(|_| {}).await?;

    let first = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    h.service.run_workers_until_idle().await;
    let vectors = h.index.count(None).await?;

    let again = h
        .service
        .upload("alice", "renamed.txt", ALICE_TEXT.as_bytes())
        .await?;
    assert_eq!(again.document_id, first.document_id);
    assert!(again.duplicate);
    assert_eq!(again.job_id, None);
    assert_eq!(again.status, DocumentStatus::Indexed);
    assert_eq!(h.service.queue().queue_size().await, 0);

    h.service.run_workers_until_idle().await;
    assert_eq!(h.index.count(None).await?, vectors);
    assert_eq!(h.registry.list("alice").await?.len(), 1);

    // Same bytes from another owner is a different document
    let bob = h.service.upload("bob", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    assert_ne!(bob.document_id, first.document_id);
    assert!(!bob.duplicate);
    Ok(())
}

#[tokio::test]
async fn test_reupload_before_indexing_reuses_the_job() -> Result<()> {
    let h = Harness::new(|_| {}).await?;

    let first = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    let again = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    assert_eq!(again.document_id, first.document_id);
    assert_eq!(again.job_id, first.job_id);
    assert!(again.duplicate);
    assert_eq!(h.service.queue().queue_size().await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_uploads_share_one_document() -> Result<()> {
    let h = Harness::new(|_| {}).await?;

    let (a, b, c) = tokio::join!(
        h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()),
        h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()),
        h.service.upload("alice", "copy.txt", ALICE_TEXT.as_bytes()),
    );
    let (a, b, c) = (a?, b?, c?);
    assert_eq!(a.document_id, b.document_id);
    assert_eq!(a.document_id, c.document_id);
    assert_eq!([&a, &b, &c].iter().filter(|r| !r.duplicate).count(), 1);
    assert_eq!(h.service.queue().queue_size().await, 1);

    let stats = h.service.run_workers_until_idle().await;
    assert_eq!(stats.indexed, 1);
    assert_eq!(h.registry.get(&a.document_id).await?.chunk_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_chunks_cover_the_source_text() -> Result<()> {
    let h = Harness::new(|c| {
        c.chunking.chunk_size = 60;
        c.chunking.chunk_overlap = 10;
    })
    .await?;
    let text = "Retrieval systems split documents into passages. Each passage is embedded \
                separately.\n\nOverlap keeps sentences that straddle a boundary searchable. \
                The last passage always ends at the end of the text.";

    let receipt = h.service.upload("alice", "notes.md", text.as_bytes()).await?;
    h.service.run_workers_until_idle().await;

    let chunks = h.registry.chunks(&receipt.document_id).await?;
    assert!(chunks.len() > 2);
    assert_eq!(chunks[0].start, 0);
    assert_eq!(chunks.last().map(|c| c.end), Some(text.chars().count()));
    for pair in chunks.windows(2) {
        assert!(pair[1].start <= pair[0].end, "gap between chunks");
        assert!(pair[0].end - pair[1].start <= 10, "overlap beyond configured window");
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_index_once() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    h.index.upsert_delay_ms.store(50, Ordering::SeqCst);
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;

    let pipeline = Arc::new(h.pipeline(PipelineConfig::default())?);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = pipeline.clone();
        let id = receipt.document_id.clone();
        handles.push(tokio::spawn(async move {
            pipeline.run(&JobContext::new(id, JobKind::Ingest)).await
        }));
    }

    let mut indexed = 0;
    for handle in handles {
        match handle.await?? {
            IngestionOutcome::Indexed { chunks } => {
                assert_eq!(chunks, 2);
                indexed += 1;
            }
            IngestionOutcome::Duplicate | IngestionOutcome::AlreadyIndexed => {}
        }
    }
    assert_eq!(indexed, 1);
    assert_eq!(h.index.upserts.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.get(&receipt.document_id).await?.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn test_embedding_failure_mid_document_persists_nothing() -> Result<()> {
    let embedder = Arc::new(FailingEmbedder {
        inner: HashEmbedProvider::with_dimension(64)?,
        calls: AtomicUsize::new(0),
        fail_from: 2,
    });
    let h = Harness::with_embedder(|_| {}, embedder).await?;
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;

    // One chunk per call, so the second chunk's call fails
    let pipeline = h.pipeline(PipelineConfig::default().with_batch_size(1))?;
    let err = pipeline
        .run(&JobContext::new(&receipt.document_id, JobKind::Ingest))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmbeddingUnavailable);
    assert!(err.is_retryable());

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(doc.chunk_count, 0);
    let failure = doc.last_error.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::EmbeddingUnavailable);
    assert!(!failure.terminal);
    assert!(h.registry.chunks(&receipt.document_id).await?.is_empty());
    assert_eq!(h.index.count(None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_index_fails_terminally_after_retries() -> Result<()> {
    let h = Harness::new(|c| c.jobs.max_retries = 3).await?;
    h.index.unreachable.store(true, Ordering::SeqCst);

    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    let job_id = receipt.job_id.expect("job queued");

    let stats = h.service.run_workers_until_idle().await;
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.failed, 1);

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(doc.attempts, 4);
    let failure = doc.last_error.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::IndexUnavailable);
    assert!(failure.terminal);

    let job = h.service.queue().status(job_id).await.expect("job known");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 4);

    // Nothing is retried automatically any more, even after recovery
    h.index.unreachable.store(false, Ordering::SeqCst);
    assert_eq!(h.service.recover().await?.requeued, 0);
    assert_eq!(h.service.run_workers_until_idle().await.indexed, 0);
    Ok(())
}

#[tokio::test]
async fn test_index_recovers_within_retry_budget() -> Result<()> {
    let h = Harness::new(|c| {
        c.jobs.backoff_base_ms = 100;
        c.jobs.backoff_max_ms = 100;
    })
    .await?;
    h.index.unreachable.store(true, Ordering::SeqCst);
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;

    let running = h.service.start_workers();
    h.wait_for_status(&receipt.document_id, DocumentStatus::Failed)
        .await?;
    h.index.unreachable.store(false, Ordering::SeqCst);
    h.wait_for_status(&receipt.document_id, DocumentStatus::Indexed)
        .await?;
    let stats = running.stop().await;

    assert!(stats.retried >= 1);
    assert_eq!(stats.indexed, 1);
    assert!(h.registry.get(&receipt.document_id).await?.last_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_index_timeout_is_index_unavailable() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    h.index.upsert_delay_ms.store(500, Ordering::SeqCst);
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;

    let pipeline = h.pipeline(
        PipelineConfig::default().with_index_timeout(Duration::from_millis(20)),
    )?;
    let err = pipeline
        .run(&JobContext::new(&receipt.document_id, JobKind::Ingest))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::IndexUnavailable { .. }));

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(
        doc.last_error.map(|e| e.kind),
        Some(ErrorKind::IndexUnavailable)
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_claim_drops_the_job() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    let job_id = receipt.job_id.expect("job queued");

    assert_eq!(h.service.cancel(job_id).await?, JobStatus::Cancelled);
    let stats = h.service.run_workers_until_idle().await;
    assert_eq!(stats.indexed, 0);

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Failed);
    let failure = doc.last_error.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert!(failure.terminal);
    assert_eq!(h.index.count(None).await?, 0);

    // Cancelling again changes nothing, and recovery does not undo it
    assert_eq!(h.service.cancel(job_id).await?, JobStatus::Cancelled);
    assert_eq!(h.registry.get(&receipt.document_id).await?.attempts, 1);
    assert_eq!(h.service.recover().await?.requeued, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_reindex_keeps_document_indexed() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    h.service.run_workers_until_idle().await;

    let job = h.service.reindex(&receipt.document_id, "alice").await?;
    assert_eq!(h.service.cancel(job).await?, JobStatus::Cancelled);

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Indexed);
    assert_eq!(h.index.count(Some("owner:alice")).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_job_leaves_document_failed() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    h.index.upsert_delay_ms.store(300, Ordering::SeqCst);
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    let job_id = receipt.job_id.expect("job queued");

    let running = h.service.start_workers();
    h.wait_for_status(&receipt.document_id, DocumentStatus::Processing)
        .await?;
    assert_eq!(h.service.cancel(job_id).await?, JobStatus::Running);
    h.wait_for_status(&receipt.document_id, DocumentStatus::Failed)
        .await?;
    let stats = running.stop().await;
    assert_eq!(stats.cancelled, 1);

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.chunk_count, 0);
    assert_eq!(doc.last_error.map(|e| e.kind), Some(ErrorKind::Cancelled));
    assert_eq!(h.index.count(None).await?, 0);
    assert_eq!(
        h.service.queue().status(job_id).await.map(|j| j.status),
        Some(JobStatus::Cancelled)
    );
    Ok(())
}

#[tokio::test]
async fn test_queries_are_scoped_to_the_owner() -> Result<()> {
    let h = Harness::new(|c| c.retrieval.min_score = 0.99).await?;
    h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    h.service.upload("bob", "sea.txt", b"The sea is deep.").await?;
    h.service.run_workers_until_idle().await;

    let alice = h
        .service
        .query(&h.service.new_query("The sea is deep.", "alice"))
        .await?;
    assert!(alice.is_empty());

    let bob = h
        .service
        .query(&h.service.new_query("The sea is deep.", "bob"))
        .await?;
    assert_eq!(bob.len(), 1);
    assert_eq!(bob.passages[0].text, "The sea is deep.");

    let nobody = h
        .service
        .query(&h.service.new_query("The sea is deep.", "carol"))
        .await?;
    assert!(nobody.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unrelated_query_is_empty_at_default_settings() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    h.service.run_workers_until_idle().await;

    let unrelated = h
        .service
        .query(&h.service.new_query("quantum chromodynamics lattice", "alice"))
        .await?;
    assert!(unrelated.is_empty());

    let related = h
        .service
        .query(&h.service.new_query("blue sky", "alice"))
        .await?;
    assert!(!related.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_vectors_left_by_failed_cleanup_are_never_returned() -> Result<()> {
    let h = Harness::new(|c| c.jobs.max_retries = 0).await?;
    h.index.lost_upsert_ack.store(true, Ordering::SeqCst);
    h.index.chunk_deletes_fail.store(true, Ordering::SeqCst);

    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    let stats = h.service.run_workers_until_idle().await;
    assert_eq!(stats.failed, 1);

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(
        doc.last_error.map(|e| e.kind),
        Some(ErrorKind::IndexUnavailable)
    );
    // The write landed and its compensation failed
    assert_eq!(h.index.count(Some("owner:alice")).await?, 2);

    let result = h
        .service
        .query(&h.service.new_query("blue sky", "alice"))
        .await?;
    assert!(result.is_empty());

    // The next attempt clears the leftovers before writing
    h.index.lost_upsert_ack.store(false, Ordering::SeqCst);
    h.index.chunk_deletes_fail.store(false, Ordering::SeqCst);
    h.service.reindex(&receipt.document_id, "alice").await?;
    assert_eq!(h.service.run_workers_until_idle().await.indexed, 1);

    assert_eq!(h.index.count(Some("owner:alice")).await?, 2);
    let result = h
        .service
        .query(&h.service.new_query("blue sky", "alice"))
        .await?;
    assert_eq!(result.passages[0].document_id, receipt.document_id);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_index_is_an_error_not_an_empty_result() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    h.service.run_workers_until_idle().await;

    h.index.unreachable.store(true, Ordering::SeqCst);
    let err = h
        .service
        .query(&h.service.new_query("blue sky", "alice"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Index unavailable"));

    let health = h.service.health().await;
    assert!(!health.is_healthy());
    assert!(!health.index_connected);
    Ok(())
}

#[tokio::test]
async fn test_reindex_replaces_chunks() -> Result<()> {
    let h = Harness::new(|_| {}).await?;
    let receipt = h.service.upload("alice", "sky.txt", ALICE_TEXT.as_bytes()).await?;
    h.service.run_workers_until_idle().await;

    let job = h.service.reindex(&receipt.document_id, "alice").await?;
    h.service.run_workers_until_idle().await;

    let doc = h.registry.get(&receipt.document_id).await?;
    assert_eq!(doc.status, DocumentStatus::Indexed);
    assert_eq!(doc.attempts, 2);
    assert_eq!(h.index.count(Some("owner:alice")).await?, 2);
    assert_eq!(
        h.service.queue().status(job).await.map(|j| j.kind),
        Some(JobKind::Reindex)
    );
    Ok(())
}
