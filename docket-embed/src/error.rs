//! Error types for the embedding system

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Callers distinguish two families of failure:
///
/// - **Transient**: [`EmbedError::Unavailable`] and the runtime variants. The model
///   or upstream service could not answer right now; the whole batch failed and the
///   caller should retry it later.
/// - **Permanent**: configuration and shape errors that will fail the same way on
///   every retry.
///
/// Use [`EmbedError::is_transient`] rather than matching variants when deciding
/// whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// The embedding backend could not produce a result for the batch
    #[error("Embedding unavailable: {message}")]
    Unavailable { message: String },

    /// A provider returned vectors of the wrong length
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A provider returned a different number of vectors than inputs
    #[error("Embedding batch size mismatch: {inputs} inputs, {outputs} vectors")]
    BatchSizeMismatch { inputs: usize, outputs: usize },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create a model initialization error from any error type.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an unavailable error with a custom message.
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Whether retrying the same batch later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::AsyncTask { .. } | Self::External { .. } | Self::Io { .. }
        )
    }
}
