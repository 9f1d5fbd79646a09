//! Configuration for embedding providers

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Deterministic feature-hashing embeddings, no model files required
    Hash,
    /// Local ONNX models through fastembed
    FastEmbed,
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Hash
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "fastembed" => Ok(Self::FastEmbed),
            other => Err(EmbedError::invalid_config(format!(
                "unknown embedding provider: {other}"
            ))),
        }
    }
}

/// Configuration for embedding providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Backend that produces the vectors
    pub provider: ProviderKind,
    /// Name of the embedding model to use (fastembed catalogue name)
    pub model_name: String,
    /// Vector dimension for the hash provider; fastembed models report their own
    pub dimension: usize,
    /// Maximum batch size for embedding generation
    pub batch_size: usize,
    /// Whether to normalize embeddings
    pub normalize: bool,
    /// Upper bound on a single embedding call, in seconds
    pub timeout_secs: u64,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hash,
            model_name: "all-minilm-l6-v2".to_string(),
            dimension: 384,
            batch_size: 32,
            normalize: true,
            timeout_secs: 30,
        }
    }
}

impl EmbedConfig {
    /// Configuration for the hash provider with the given dimension.
    pub fn hash(dimension: usize) -> Self {
        Self {
            provider: ProviderKind::Hash,
            model_name: "feature-hash".to_string(),
            dimension,
            ..Self::default()
        }
    }

    /// Configuration for a fastembed catalogue model.
    pub fn fastembed(model_name: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the per-call timeout (builder style)
    pub fn with_timeout_secs(self, timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            ..self
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be greater than 0"));
        }
        if self.timeout_secs == 0 {
            return Err(EmbedError::invalid_config("timeout_secs must be greater than 0"));
        }
        if self.provider == ProviderKind::Hash && self.dimension == 0 {
            return Err(EmbedError::invalid_config(
                "dimension must be greater than 0 for the hash provider",
            ));
        }
        Ok(())
    }
}
