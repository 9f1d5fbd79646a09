//! Configuration loading for docket.
//!
//! Every field has a default, so an absent or partial `docket.toml` is valid:
//!
//! ```toml
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 80
//!
//! [embedding]
//! provider = "fastembed"
//! model_name = "bge-small-en-v1.5"
//!
//! [retrieval]
//! top_k = 8
//! min_score = 0.2
//!
//! [jobs]
//! max_retries = 3
//! workers = 2
//! ```

use crate::error::ConfigError;
use docket_context::ChunkerConfig;
use docket_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "docket.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocketConfig {
    pub chunking: ChunkingSettings,
    pub embedding: EmbedConfig,
    pub index: IndexSettings,
    pub retrieval: RetrievalSettings,
    pub jobs: JobSettings,
    pub intake: IntakeSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Target chunk length in characters
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks
    pub chunk_overlap: usize,
    /// Boundary search window; defaults to a quarter of `chunk_size`
    pub lookback: Option<usize>,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
            lookback: None,
        }
    }
}

impl ChunkingSettings {
    pub fn chunker_config(&self) -> ChunkerConfig {
        let config = ChunkerConfig::new(self.chunk_size, self.chunk_overlap);
        match self.lookback {
            Some(lookback) => config.with_lookback(lookback),
            None => config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub timeout_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl IndexSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    /// Candidates fetched per requested result before dedup and filtering
    pub overfetch_factor: usize,
    /// Results must score above this cosine similarity
    pub min_score: f32,
    /// Jaccard word-set similarity at which two chunks of one document count as duplicates
    pub dedup_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            overfetch_factor: 2,
            min_score: 0.2,
            dedup_threshold: 0.9,
        }
    }
}

impl RetrievalSettings {
    /// Overfetch never drops below 2 so dedup has room to work.
    pub fn effective_overfetch(&self) -> usize {
        self.overfetch_factor.max(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Retries after the first attempt before a job is terminally failed
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a worker may hold a job before it is redelivered
    pub lease_secs: u64,
    pub workers: usize,
    pub max_queue_size: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            lease_secs: 300,
            workers: 4,
            max_queue_size: 10_000,
        }
    }
}

impl JobSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            allowed_extensions: vec!["pdf".to_string(), "txt".to_string(), "md".to_string()],
        }
    }
}

impl IntakeSettings {
    pub fn allows(&self, extension: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".docket"),
        }
    }
}

impl StorageSettings {
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.data_dir.join("vectors.db")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

impl DocketConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else `docket.toml` in the working directory if it
    /// exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::invalid("chunking.chunk_size must be > 0"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::invalid(
                "chunking.chunk_overlap must be less than chunking.chunk_size",
            ));
        }
        if self.chunking.lookback == Some(0) {
            return Err(ConfigError::invalid("chunking.lookback must be > 0"));
        }
        self.embedding
            .validate()
            .map_err(|e| ConfigError::invalid(format!("embedding: {e}")))?;
        if self.index.timeout_secs == 0 {
            return Err(ConfigError::invalid("index.timeout_secs must be > 0"));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::invalid("retrieval.top_k must be >= 1"));
        }
        if self.retrieval.overfetch_factor < 1 {
            return Err(ConfigError::invalid("retrieval.overfetch_factor must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(ConfigError::invalid("retrieval.min_score must be in [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.dedup_threshold) {
            return Err(ConfigError::invalid(
                "retrieval.dedup_threshold must be in [0.0, 1.0]",
            ));
        }
        if self.jobs.workers == 0 {
            return Err(ConfigError::invalid("jobs.workers must be >= 1"));
        }
        if self.jobs.max_queue_size == 0 {
            return Err(ConfigError::invalid("jobs.max_queue_size must be >= 1"));
        }
        if self.jobs.lease_secs == 0 {
            return Err(ConfigError::invalid("jobs.lease_secs must be > 0"));
        }
        if self.intake.max_file_size == 0 {
            return Err(ConfigError::invalid("intake.max_file_size must be > 0"));
        }
        Ok(())
    }
}
