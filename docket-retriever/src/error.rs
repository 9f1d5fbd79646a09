//! Error types for docket-retriever.
//!
//! Each component has its own error enum. [`PipelineError`] is the taxonomy the
//! ingestion pipeline and dispatcher act on: every variant maps to a stable
//! [`ErrorKind`] code that is persisted on the document, and
//! [`PipelineError::is_retryable`] decides whether the job goes back on the queue.

use crate::storage::{Document, DocumentStatus};
use docket_context::ChunkError;
use docket_embed::EmbedError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable error codes recorded in the registry and shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidConfig,
    UnprocessableContent,
    ExtractionUnavailable,
    EmbeddingUnavailable,
    IndexUnavailable,
    AlreadyInFlight,
    InvalidTransition,
    Cancelled,
    /// A worker stopped mid-attempt and the document was recovered on restart
    Interrupted,
    RegistryUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "InvalidConfig",
            Self::UnprocessableContent => "UnprocessableContent",
            Self::ExtractionUnavailable => "ExtractionUnavailable",
            Self::EmbeddingUnavailable => "EmbeddingUnavailable",
            Self::IndexUnavailable => "IndexUnavailable",
            Self::AlreadyInFlight => "AlreadyInFlight",
            Self::InvalidTransition => "InvalidTransition",
            Self::Cancelled => "Cancelled",
            Self::Interrupted => "Interrupted",
            Self::RegistryUnavailable => "RegistryUnavailable",
        }
    }

    /// Whether a job failing with this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExtractionUnavailable
                | Self::EmbeddingUnavailable
                | Self::IndexUnavailable
                | Self::Interrupted
                | Self::RegistryUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "InvalidConfig" => Self::InvalidConfig,
            "UnprocessableContent" => Self::UnprocessableContent,
            "ExtractionUnavailable" => Self::ExtractionUnavailable,
            "EmbeddingUnavailable" => Self::EmbeddingUnavailable,
            "IndexUnavailable" => Self::IndexUnavailable,
            "AlreadyInFlight" => Self::AlreadyInFlight,
            "InvalidTransition" => Self::InvalidTransition,
            "Cancelled" => Self::Cancelled,
            "Interrupted" => Self::Interrupted,
            "RegistryUnavailable" => Self::RegistryUnavailable,
            other => return Err(format!("unknown error kind: {other}")),
        };
        Ok(kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Document not found: {id}")]
    NotFound { id: String },

    #[error("Invalid transition for document {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("Document {id} is already being processed")]
    AlreadyInFlight { id: String },

    /// Identical content is already indexed for this owner. Callers treat this
    /// as an idempotent success and use `existing`.
    #[error("Content already indexed as document {}", .existing.id)]
    DuplicateContent { existing: Box<Document> },

    #[error("Registry storage error: {source}")]
    Storage {
        #[from]
        source: sqlx::Error,
    },

    #[error("Corrupt registry record: {message}")]
    Corrupt { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Vector index unavailable: {message}")]
    Unavailable { message: String },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Corrupt vector record {id}: {message}")]
    Corrupt { id: String, message: String },
}

impl IndexError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        Self::unavailable(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The stored content can never yield text
    #[error("Unprocessable content: {message}")]
    Malformed { message: String },

    /// The content could not be read right now
    #[error("Extraction unavailable: {message}")]
    Unavailable { message: String },
}

impl ExtractError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Failures of one ingestion attempt.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unprocessable content: {message}")]
    UnprocessableContent { message: String },

    #[error("Extraction unavailable: {message}")]
    ExtractionUnavailable { message: String },

    #[error("Embedding unavailable: {message}")]
    EmbeddingUnavailable { message: String },

    #[error("Index unavailable: {message}")]
    IndexUnavailable { message: String },

    #[error("Document {document_id} is already being processed")]
    AlreadyInFlight { document_id: String },

    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },

    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Registry error: {source}")]
    Registry {
        #[source]
        source: RegistryError,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::UnprocessableContent { .. } => ErrorKind::UnprocessableContent,
            Self::ExtractionUnavailable { .. } => ErrorKind::ExtractionUnavailable,
            Self::EmbeddingUnavailable { .. } => ErrorKind::EmbeddingUnavailable,
            Self::IndexUnavailable { .. } => ErrorKind::IndexUnavailable,
            Self::AlreadyInFlight { .. } => ErrorKind::AlreadyInFlight,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Registry { .. } => ErrorKind::RegistryUnavailable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registry { source } => matches!(source, RegistryError::Storage { .. }),
            other => other.kind().is_retryable(),
        }
    }

    pub fn embedding_timeout(after: std::time::Duration) -> Self {
        Self::EmbeddingUnavailable {
            message: format!("embedding call timed out after {after:?}"),
        }
    }

    pub fn index_timeout(after: std::time::Duration) -> Self {
        Self::IndexUnavailable {
            message: format!("index call timed out after {after:?}"),
        }
    }
}

impl From<ChunkError> for PipelineError {
    fn from(e: ChunkError) -> Self {
        Self::InvalidConfig {
            message: e.to_string(),
        }
    }
}

impl From<EmbedError> for PipelineError {
    fn from(e: EmbedError) -> Self {
        if e.is_transient() {
            Self::EmbeddingUnavailable {
                message: e.to_string(),
            }
        } else {
            Self::InvalidConfig {
                message: e.to_string(),
            }
        }
    }
}

impl From<IndexError> for PipelineError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Unavailable { message } => Self::IndexUnavailable { message },
            IndexError::Corrupt { .. } => Self::UnprocessableContent {
                message: e.to_string(),
            },
            IndexError::DimensionMismatch { .. } => Self::InvalidConfig {
                message: e.to_string(),
            },
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Malformed { message } => Self::UnprocessableContent { message },
            ExtractError::Unavailable { message } => Self::ExtractionUnavailable { message },
        }
    }
}

impl From<RegistryError> for PipelineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyInFlight { id } => Self::AlreadyInFlight { document_id: id },
            RegistryError::InvalidTransition { .. } => Self::InvalidTransition {
                message: e.to_string(),
            },
            other => Self::Registry { source: other },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("Job queue is shut down")]
    Shutdown,

    #[error("Unknown job: {0}")]
    UnknownJob(u64),

    /// The lease expired and the job was handed to another worker
    #[error("Stale lease for job {0}")]
    StaleLease(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Invalid query: {message}")]
    InvalidConfig { message: String },

    #[error("Embedding unavailable: {message}")]
    EmbeddingUnavailable { message: String },

    #[error("Index unavailable: {message}")]
    IndexUnavailable { message: String },

    #[error("Registry unavailable: {source}")]
    Registry {
        #[from]
        source: RegistryError,
    },
}

impl From<EmbedError> for RetrievalError {
    fn from(e: EmbedError) -> Self {
        if e.is_transient() {
            Self::EmbeddingUnavailable {
                message: e.to_string(),
            }
        } else {
            Self::InvalidConfig {
                message: e.to_string(),
            }
        }
    }
}

impl From<IndexError> for RetrievalError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::DimensionMismatch { .. } => Self::InvalidConfig {
                message: e.to_string(),
            },
            other => Self::IndexUnavailable {
                message: other.to_string(),
            },
        }
    }
}

/// Errors surfaced by the intake service.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Uploaded file is empty")]
    Empty,

    #[error("File too large: {size} bytes (limit {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported file type: {extension}")]
    UnsupportedType { extension: String },

    #[error("Owner must not be empty")]
    MissingOwner,

    #[error("Document not found: {id}")]
    NotFound { id: String },

    #[error("Document {id} belongs to another owner")]
    Forbidden { id: String },

    #[error("Document {id} is being processed; try again later")]
    Busy { id: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Embedding provider setup failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("Content storage error: {source}")]
    Storage {
        #[from]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}
