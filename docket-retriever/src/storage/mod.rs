//! Storage layer for docket-retriever.
//!
//! Three stores sit behind traits so the pipeline and tests can swap them:
//!
//! - **[`DocumentRegistry`]**: documents, their processing status and chunk records
//! - **[`VectorIndex`]**: chunk vectors partitioned by owner collection
//! - **[`ContentSource`](content::ContentSource)**: uploaded bytes and text extraction
//!
//! ```text
//! upload ─→ ContentStore (blobs/)      DocumentRegistry (registry.db)
//!                 │                           │ status + chunk records
//!                 └──→ IngestionPipeline ─────┤
//!                                             └─→ VectorIndex (vectors.db)
//! ```
//!
//! The registry and the vector index are separate databases. They are kept in
//! step only by the ingestion pipeline.

use crate::error::{ErrorKind, IndexError, RegistryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub mod content;
pub mod registry;
pub mod vector_index;

pub use content::{ContentSource, ExtractedText, FsContentStore};
pub use registry::SqliteRegistry;
pub use vector_index::SqliteVectorIndex;

/// Hex blake3 digest of the uploaded bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Stable document id: the same owner and content always map to the same id.
pub fn document_id(owner: &str, content_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(owner.as_bytes());
    hasher.update(&[0]);
    hasher.update(content_hash.as_bytes());
    let digest = hex::encode(hasher.finalize().as_bytes());
    digest[..32].to_string()
}

/// Chunk ids sort by sequence within a document.
pub fn chunk_id(document_id: &str, sequence: usize) -> String {
    format!("{document_id}:{sequence:06}")
}

/// Vector index partition for one owner.
pub fn collection_key(owner: &str) -> String {
    format!("owner:{owner}")
}

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Indexed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Indexed => "INDEXED",
            Self::Failed => "FAILED",
        }
    }

    /// Moves allowed by a plain transition. `INDEXED -> PROCESSING` is only
    /// reachable through a reindex claim.
    pub fn can_transition_to(&self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, to),
            (Pending, Processing) | (Failed, Processing) | (Processing, Indexed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "INDEXED" => Ok(Self::Indexed),
            "FAILED" => Ok(Self::Failed),
            other => Err(RegistryError::Corrupt {
                message: format!("unknown document status: {other}"),
            }),
        }
    }
}

/// The error recorded on a FAILED document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// No automatic retry will happen
    pub terminal: bool,
}

impl FailureRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>, terminal: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            terminal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub content_hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub last_error: Option<FailureRecord>,
    pub chunk_count: usize,
    /// Number of times the document has been claimed for processing
    pub attempts: u32,
}

impl Document {
    /// Lowercase file extension, empty when the filename has none.
    pub fn extension(&self) -> String {
        file_extension(&self.filename)
    }

    pub fn collection(&self) -> String {
        collection_key(&self.owner)
    }
}

pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// A persisted chunk, without its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub sequence: usize,
    /// Character offsets into the extracted text
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub section: Option<String>,
    pub page: Option<u32>,
}

/// Outcome of [`DocumentRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    Created(Document),
    /// Same owner and content, not yet indexed
    Existing(Document),
}

impl Registration {
    pub fn document(&self) -> &Document {
        match self {
            Self::Created(doc) | Self::Existing(doc) => doc,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Self::Created(doc) | Self::Existing(doc) => doc,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Which statuses a claim may move to PROCESSING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// PENDING or FAILED
    Ingest,
    /// INDEXED, FAILED or PENDING
    Reindex,
}

impl ClaimMode {
    pub fn accepts(&self) -> &'static [DocumentStatus] {
        match self {
            Self::Ingest => &[DocumentStatus::Pending, DocumentStatus::Failed],
            Self::Reindex => &[
                DocumentStatus::Indexed,
                DocumentStatus::Failed,
                DocumentStatus::Pending,
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub documents: usize,
    pub chunks: usize,
    pub total_bytes: u64,
    pub by_status: BTreeMap<String, usize>,
    pub by_extension: BTreeMap<String, usize>,
}

/// Durable record of documents and their processing state.
#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    /// Create a PENDING record, or return the existing one for the same owner
    /// and content. Fails with `DuplicateContent` when that record is INDEXED.
    async fn register(
        &self,
        owner: &str,
        content_hash: &str,
        filename: &str,
        size: u64,
    ) -> Result<Registration, RegistryError>;

    /// Compare-and-set status change following the state machine.
    async fn transition(
        &self,
        document_id: &str,
        new_status: DocumentStatus,
        failure: Option<&FailureRecord>,
    ) -> Result<Document, RegistryError>;

    /// Atomically move the document to PROCESSING. Exactly one concurrent
    /// caller wins; the others get `AlreadyInFlight`.
    async fn claim(&self, document_id: &str, mode: ClaimMode) -> Result<Document, RegistryError>;

    /// Replace chunk records and move PROCESSING -> INDEXED in one transaction.
    async fn complete(
        &self,
        document_id: &str,
        chunks: &[ChunkRecord],
    ) -> Result<Document, RegistryError>;

    /// Move PROCESSING -> FAILED, recording the failure and dropping chunk records.
    async fn fail(
        &self,
        document_id: &str,
        failure: &FailureRecord,
    ) -> Result<Document, RegistryError>;

    /// Flag a FAILED document's error as terminal. Returns false when the
    /// document is not FAILED.
    async fn mark_terminal(&self, document_id: &str) -> Result<bool, RegistryError>;

    async fn get(&self, document_id: &str) -> Result<Document, RegistryError>;

    async fn list(&self, owner: &str) -> Result<Vec<Document>, RegistryError>;

    async fn with_status(&self, status: DocumentStatus) -> Result<Vec<Document>, RegistryError>;

    async fn chunks(&self, document_id: &str) -> Result<Vec<ChunkRecord>, RegistryError>;

    /// Remove the document and its chunk records, returning the removed chunk ids.
    async fn delete(&self, document_id: &str) -> Result<Vec<String>, RegistryError>;

    async fn stats(&self, owner: Option<&str>) -> Result<RegistryStats, RegistryError>;

    async fn health(&self) -> Result<(), RegistryError>;
}

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub owner: String,
    pub sequence: usize,
    pub start: usize,
    pub end: usize,
    pub filename: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Open extension map for caller-defined fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<half::f16>,
    pub metadata: ChunkMetadata,
}

/// Every present field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub owner: Option<String>,
    pub document_ids: Option<Vec<String>>,
    pub filename: Option<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SearchFilter {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }

    pub fn with_documents(mut self, ids: Vec<String>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if let Some(owner) = &self.owner {
            if &metadata.owner != owner {
                return false;
            }
        }
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| id == &metadata.document_id) {
                return false;
            }
        }
        if let Some(filename) = &self.filename {
            if &metadata.filename != filename {
                return false;
            }
        }
        self.extra
            .iter()
            .all(|(key, value)| metadata.extra.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Nearest-neighbour store partitioned by collection key.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<(), IndexError>;

    /// Up to `top_k` hits by descending score, ties by ascending id.
    async fn search(
        &self,
        collection: &str,
        query: &[half::f16],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, IndexError>;

    /// Remove every vector of one document, whatever its chunk ids.
    async fn delete_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, IndexError>;

    /// Number of vectors, in one collection or overall.
    async fn count(&self, collection: Option<&str>) -> Result<usize, IndexError>;

    async fn health(&self) -> Result<(), IndexError>;
}

/// Opens a SQLite pool on disk with WAL and foreign keys enabled.
pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true),
    )
    .await
}

/// In-memory pool for tests. A single long-lived connection keeps the database alive.
pub(crate) async fn open_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(
            SqliteConnectOptions::new()
                .in_memory(true)
                .foreign_keys(true),
        )
        .await
}
