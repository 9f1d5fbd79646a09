//! Ingestion pipeline: one document from stored bytes to indexed chunks.
//!
//! ## Pipeline Flow
//!
//! ```text
//! claim → (reindex: drop old vectors) → load text → chunk → embed → upsert → complete
//!                                                                      ↓ on error
//!                                              delete upserted vectors → fail
//! ```
//!
//! Indexing is all-or-nothing per document: a failure at any step removes the
//! vectors this attempt wrote and leaves the document FAILED with no chunk
//! records. The registry claim is the only mutual-exclusion point, so a
//! duplicate delivery of the same job returns [`IngestionOutcome::Duplicate`]
//! without touching anything.

use super::task_queue::JobKind;
use crate::config::DocketConfig;
use crate::error::{ConfigError, PipelineError, RegistryError};
use crate::storage::{
    chunk_id, ChunkMetadata, ChunkRecord, ClaimMode, ContentSource, Document, DocumentRegistry,
    DocumentStatus, FailureRecord, VectorIndex, VectorRecord,
};
use docket_context::{Chunker, TextChunk};
use docket_embed::EmbeddingProvider;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timeouts and batching for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Bound on each embedding call
    pub embed_timeout: Duration,
    /// Bound on each vector index call
    pub index_timeout: Duration,
    /// Chunks per embedding call
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embed_timeout: Duration::from_secs(30),
            index_timeout: Duration::from_secs(10),
            batch_size: 32,
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &DocketConfig) -> Self {
        Self {
            embed_timeout: config.embedding.timeout(),
            index_timeout: config.index.timeout(),
            batch_size: config.embedding.batch_size.max(1),
        }
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// What a worker hands the pipeline for one delivery of a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub document_id: String,
    pub kind: JobKind,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(document_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            document_id: document_id.into(),
            kind,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionOutcome {
    Indexed { chunks: usize },
    /// Another delivery holds the document
    Duplicate,
    /// Redelivery after a successful run
    AlreadyIndexed,
}

pub struct IngestionPipeline {
    registry: Arc<dyn DocumentRegistry>,
    index: Arc<dyn VectorIndex>,
    content: Arc<dyn ContentSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<dyn DocumentRegistry>,
        index: Arc<dyn VectorIndex>,
        content: Arc<dyn ContentSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            index,
            content,
            embedder,
            chunker,
            config,
        }
    }

    /// Build from configuration with the given collaborators.
    pub fn from_config(
        config: &DocketConfig,
        registry: Arc<dyn DocumentRegistry>,
        index: Arc<dyn VectorIndex>,
        content: Arc<dyn ContentSource>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, ConfigError> {
        let chunker = Chunker::new(config.chunking.chunker_config())
            .map_err(|e| ConfigError::invalid(e.to_string()))?;
        Ok(Self::new(
            registry,
            index,
            content,
            embedder,
            chunker,
            PipelineConfig::from_config(config),
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one delivery of an ingestion or reindex job.
    ///
    /// Errors after a successful claim have already been recorded on the
    /// document (FAILED, terminal when not retryable) by the time they are
    /// returned.
    pub async fn run(&self, job: &JobContext) -> Result<IngestionOutcome, PipelineError> {
        let document = self.registry.get(&job.document_id).await?;
        if job.kind == JobKind::Ingest && document.status == DocumentStatus::Indexed {
            debug!("Document {} is already indexed", document.id);
            return Ok(IngestionOutcome::AlreadyIndexed);
        }

        let mode = match job.kind {
            JobKind::Ingest => ClaimMode::Ingest,
            JobKind::Reindex => ClaimMode::Reindex,
        };
        let document = match self.registry.claim(&document.id, mode).await {
            Ok(document) => document,
            Err(RegistryError::AlreadyInFlight { id }) => {
                info!("Document {} is already being processed, dropping duplicate", id);
                return Ok(IngestionOutcome::Duplicate);
            }
            Err(RegistryError::InvalidTransition {
                from: DocumentStatus::Indexed,
                ..
            }) if mode == ClaimMode::Ingest => {
                return Ok(IngestionOutcome::AlreadyIndexed);
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Processing document {} ({}, attempt {})",
            document.id, document.filename, document.attempts
        );

        let mut written = Vec::new();
        match self.process(&document, job, &mut written).await {
            Ok(chunks) => {
                info!("Indexed document {} with {} chunks", document.id, chunks);
                Ok(IngestionOutcome::Indexed { chunks })
            }
            Err(e) => {
                self.abort(&document, &written, &e).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        document: &Document,
        job: &JobContext,
        written: &mut Vec<String>,
    ) -> Result<usize, PipelineError> {
        let collection = document.collection();

        // Covers a reindex and vectors an earlier failed attempt could not remove
        let stale = self
            .bounded_index(self.index.delete_document(&collection, &document.id))
            .await?;
        if stale > 0 {
            debug!("Removed {} stale vectors for {}", stale, document.id);
        }

        checkpoint(job)?;
        let extracted = self.content.load_text(document).await?;

        checkpoint(job)?;
        let chunks = self.chunker.split(&extracted.text);
        if chunks.is_empty() {
            return Err(PipelineError::UnprocessableContent {
                message: format!("{} produced no text to index", document.filename),
            });
        }
        debug!("Split {} into {} chunks", document.id, chunks.len());

        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.config.batch_size) {
            checkpoint(job)?;
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let result = tokio::time::timeout(
                self.config.embed_timeout,
                self.embedder.embed_texts(&texts),
            )
            .await
            .map_err(|_| PipelineError::embedding_timeout(self.config.embed_timeout))??;
            result.validate(texts.len(), self.embedder.embedding_dimension())?;
            vectors.extend(result.embeddings);
        }

        checkpoint(job)?;
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk_id(&document.id, chunk.sequence),
                vector,
                metadata: chunk_metadata(document, chunk),
            })
            .collect();
        written.extend(records.iter().map(|r| r.id.clone()));
        self.bounded_index(self.index.upsert(&collection, &records))
            .await?;

        checkpoint(job)?;
        let chunk_records: Vec<ChunkRecord> = chunks
            .iter()
            .map(|chunk| chunk_record(document, chunk))
            .collect();
        self.registry.complete(&document.id, &chunk_records).await?;

        Ok(chunk_records.len())
    }

    async fn bounded_index<T>(
        &self,
        call: impl Future<Output = Result<T, crate::error::IndexError>>,
    ) -> Result<T, PipelineError> {
        tokio::time::timeout(self.config.index_timeout, call)
            .await
            .map_err(|_| PipelineError::index_timeout(self.config.index_timeout))?
            .map_err(PipelineError::from)
    }

    /// Undo this attempt's vector writes and record the failure.
    async fn abort(&self, document: &Document, written: &[String], cause: &PipelineError) {
        if !written.is_empty() {
            match self
                .bounded_index(self.index.delete(&document.collection(), written))
                .await
            {
                Ok(removed) => debug!("Compensated {} vectors for {}", removed, document.id),
                Err(e) => warn!(
                    "Failed to remove {} vectors for {} after failure, leaving them for the next attempt: {}",
                    written.len(),
                    document.id,
                    e
                ),
            }
        }

        let failure = FailureRecord::new(cause.kind(), cause.to_string(), !cause.is_retryable());
        match self.registry.fail(&document.id, &failure).await {
            Ok(_) => warn!(
                "Document {} failed ({}{}): {}",
                document.id,
                failure.kind,
                if failure.terminal { ", terminal" } else { "" },
                failure.message
            ),
            Err(e) => error!(
                "Could not record failure of document {}: {} (original error: {})",
                document.id, e, cause
            ),
        }
    }
}

fn checkpoint(job: &JobContext) -> Result<(), PipelineError> {
    if job.cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn chunk_metadata(document: &Document, chunk: &TextChunk) -> ChunkMetadata {
    ChunkMetadata {
        document_id: document.id.clone(),
        owner: document.owner.clone(),
        sequence: chunk.sequence,
        start: chunk.start,
        end: chunk.end,
        filename: document.filename.clone(),
        text: chunk.text.clone(),
        section: chunk.section.clone(),
        page: chunk.page,
        extra: BTreeMap::new(),
    }
}

fn chunk_record(document: &Document, chunk: &TextChunk) -> ChunkRecord {
    ChunkRecord {
        id: chunk_id(&document.id, chunk.sequence),
        document_id: document.id.clone(),
        sequence: chunk.sequence,
        start: chunk.start,
        end: chunk.end,
        text: chunk.text.clone(),
        section: chunk.section.clone(),
        page: chunk.page,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::{
        content_hash, ExtractedText, Registration, SearchFilter, SqliteRegistry,
        SqliteVectorIndex,
    };
    use async_trait::async_trait;
    use docket_context::ChunkerConfig;
    use docket_embed::HashEmbedProvider;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryContent {
        texts: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl ContentSource for MemoryContent {
        async fn load_text(
            &self,
            document: &Document,
        ) -> Result<ExtractedText, crate::error::ExtractError> {
            let texts = self.texts.lock().unwrap();
            texts
                .get(&document.id)
                .map(|t| ExtractedText::new(t.clone(), None))
                .ok_or_else(|| crate::error::ExtractError::malformed("missing"))
        }
    }

    struct Fixture {
        registry: Arc<SqliteRegistry>,
        index: Arc<SqliteVectorIndex>,
        content: Arc<MemoryContent>,
        pipeline: IngestionPipeline,
    }

    async fn fixture(target: usize, overlap: usize) -> Fixture {
        let registry = Arc::new(SqliteRegistry::open_memory().await.unwrap());
        let index = Arc::new(SqliteVectorIndex::open_memory().await.unwrap());
        let content = Arc::new(MemoryContent::default());
        let chunker = Chunker::new(ChunkerConfig::new(target, overlap)).unwrap();
        let pipeline = IngestionPipeline::new(
            registry.clone(),
            index.clone(),
            content.clone(),
            Arc::new(HashEmbedProvider::with_dimension(64).unwrap()),
            chunker,
            PipelineConfig::default().with_batch_size(1),
        );
        Fixture {
            registry,
            index,
            content,
            pipeline,
        }
    }

    async fn upload(fx: &Fixture, owner: &str, text: &str) -> Document {
        let hash = content_hash(text.as_bytes());
        let doc = match fx
            .registry
            .register(owner, &hash, "notes.txt", text.len() as u64)
            .await
            .unwrap()
        {
            Registration::Created(doc) | Registration::Existing(doc) => doc,
        };
        fx.content
            .texts
            .lock()
            .unwrap()
            .insert(doc.id.clone(), text.to_string());
        doc
    }

    #[tokio::test]
    async fn test_indexes_document() {
        let fx = fixture(20, 5).await;
        let doc = upload(&fx, "alice", "The sky is blue. Grass is green.").await;

        let outcome = fx
            .pipeline
            .run(&JobContext::new(&doc.id, JobKind::Ingest))
            .await
            .unwrap();
        assert_eq!(outcome, IngestionOutcome::Indexed { chunks: 2 });

        let doc = fx.registry.get(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(fx.index.count(Some("owner:alice")).await.unwrap(), 2);

        // Redelivery after success is a no-op
        let again = fx
            .pipeline
            .run(&JobContext::new(&doc.id, JobKind::Ingest))
            .await
            .unwrap();
        assert_eq!(again, IngestionOutcome::AlreadyIndexed);
        assert_eq!(fx.index.count(Some("owner:alice")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_text_is_terminal() {
        let fx = fixture(20, 5).await;
        let doc = upload(&fx, "alice", "").await;

        let err = fx
            .pipeline
            .run(&JobContext::new(&doc.id, JobKind::Ingest))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnprocessableContent);
        assert!(!err.is_retryable());

        let doc = fx.registry.get(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        let failure = doc.last_error.unwrap();
        assert!(failure.terminal);
        assert_eq!(failure.kind, ErrorKind::UnprocessableContent);
    }

    #[tokio::test]
    async fn test_cancelled_job_leaves_document_failed() {
        let fx = fixture(20, 5).await;
        let doc = upload(&fx, "alice", "The sky is blue. Grass is green.").await;

        let job = JobContext::new(&doc.id, JobKind::Ingest);
        job.cancel.cancel();
        let err = fx.pipeline.run(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));

        let doc = fx.registry.get(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.chunk_count, 0);
        assert_eq!(fx.index.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_dropped() {
        let fx = fixture(20, 5).await;
        let doc = upload(&fx, "alice", "The sky is blue.").await;
        fx.registry.claim(&doc.id, ClaimMode::Ingest).await.unwrap();

        let outcome = fx
            .pipeline
            .run(&JobContext::new(&doc.id, JobKind::Ingest))
            .await
            .unwrap();
        assert_eq!(outcome, IngestionOutcome::Duplicate);
        assert_eq!(
            fx.registry.get(&doc.id).await.unwrap().status,
            DocumentStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_reindex_replaces_vectors() {
        let fx = fixture(20, 5).await;
        let doc = upload(&fx, "alice", "The sky is blue. Grass is green.").await;
        fx.pipeline
            .run(&JobContext::new(&doc.id, JobKind::Ingest))
            .await
            .unwrap();

        let outcome = fx
            .pipeline
            .run(&JobContext::new(&doc.id, JobKind::Reindex))
            .await
            .unwrap();
        assert_eq!(outcome, IngestionOutcome::Indexed { chunks: 2 });
        assert_eq!(fx.index.count(Some("owner:alice")).await.unwrap(), 2);

        let doc = fx.registry.get(&doc.id).await.unwrap();
        assert_eq!(doc.attempts, 2);

        let query = HashEmbedProvider::with_dimension(64)
            .unwrap()
            .embed_text("sky")
            .await
            .unwrap();
        let hits = fx
            .index
            .search("owner:alice", &query, 10, &SearchFilter::for_owner("alice"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }
}
