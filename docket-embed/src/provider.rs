//! Embedding provider implementations

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use crate::hash::HashEmbedProvider;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use fnv::FnvHasher;
use half::f16;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, in input order
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of f16 embeddings.
    ///
    /// The dimension is inferred from the first embedding vector, or 0 when empty.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Check that there is exactly one vector per input and every vector has
    /// `expected_dimension` components.
    pub fn validate(&self, inputs: usize, expected_dimension: usize) -> Result<()> {
        if self.embeddings.len() != inputs {
            return Err(EmbedError::BatchSizeMismatch {
                inputs,
                outputs: self.embeddings.len(),
            });
        }
        if let Some(bad) = self
            .embeddings
            .iter()
            .find(|e| e.len() != expected_dimension)
        {
            return Err(EmbedError::DimensionMismatch {
                expected: expected_dimension,
                actual: bad.len(),
            });
        }
        Ok(())
    }
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// Implementations must be order-preserving and atomic per call: either every
/// input gets a vector or the call fails. A failed call never returns a partial
/// result.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or(EmbedError::BatchSizeMismatch {
                inputs: 1,
                outputs: 0,
            })
    }

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// Build the provider selected by `config`.
pub async fn create_provider(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    match config.provider {
        ProviderKind::Hash => Ok(Arc::new(HashEmbedProvider::new(config.clone())?)),
        ProviderKind::FastEmbed => Ok(Arc::new(FastEmbedProvider::create(config.clone()).await?)),
    }
}

/// Normalize a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in values.iter_mut() {
            *value /= norm;
        }
    }
}

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

/// Get the global model cache
fn get_model_cache() -> &'static Mutex<HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| EmbedError::unavailable("embedding model lock poisoned"))
}

/// Map a catalogue name to a built-in fastembed model.
fn builtin_model(name: &str) -> Result<EmbeddingModel> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        "snowflake-arctic-embed-xs" => Ok(EmbeddingModel::SnowflakeArcticEmbedXS),
        other => Err(EmbedError::invalid_config(format!(
            "unsupported fastembed model: {other}"
        ))),
    }
}

/// FastEmbed-based embedding provider using real ONNX models
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Option<Arc<Mutex<TextEmbedding>>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("model", &self.model.is_some())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Creates a new uninitialized provider. Call [`initialize`](Self::initialize) before use.
    pub fn new(config: EmbedConfig) -> Self {
        Self {
            config,
            model: None,
            dimension: 0,
        }
    }

    /// Loads the embedding model, reusing a cached instance when one exists.
    pub async fn initialize(&mut self) -> Result<()> {
        tracing::info!(
            "Initializing FastEmbed provider for model: {}",
            self.config.model_name()
        );

        let cache_key = self.create_cache_key();

        let cached_data = {
            let cache = lock(get_model_cache())?;
            cache
                .get(&cache_key)
                .map(|(model, dim)| (Arc::clone(model), *dim))
        };

        if let Some((cached_model, cached_dimension)) = cached_data {
            tracing::info!("Using cached model for: {}", self.config.model_name());
            self.model = Some(cached_model);
            self.dimension = cached_dimension;
            return Ok(());
        }

        let builtin = builtin_model(self.config.model_name())?;
        let model_name = self.config.model_name().to_string();

        // Model loading is blocking and may download files
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                tracing::info!("Loading embedding model: {}", model_name);

                let init_options = InitOptions::new(builtin).with_show_download_progress(false);
                let mut model = TextEmbedding::try_new(init_options)
                    .map_err(|e| EmbedError::External { source: e })?;

                // Get dimension by embedding a sample string
                let sample = model
                    .embed(vec!["dimension check".to_string()], None)
                    .map_err(|e| EmbedError::External { source: e })?;
                let dimension = sample.first().map(|emb| emb.len()).unwrap_or(0);
                if dimension == 0 {
                    return Err(EmbedError::invalid_config(
                        "Model validation failed: empty embedding",
                    ));
                }

                tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                Ok((model, dimension))
            })
            .await??;

        let model_arc = Arc::new(Mutex::new(model));
        lock(get_model_cache())?.insert(cache_key, (Arc::clone(&model_arc), dimension));

        self.model = Some(model_arc);
        self.dimension = dimension;
        Ok(())
    }

    /// Creates and initializes a provider in one step.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        let mut provider = Self::new(config);
        provider.initialize().await?;
        Ok(provider)
    }

    /// Cache key derived from the model name; batch size and timeouts do not
    /// change the loaded model.
    fn create_cache_key(&self) -> String {
        let mut hasher = FnvHasher::default();
        hasher.write(b"v1:");
        hasher.write(self.config.model_name().to_lowercase().as_bytes());
        format!("v1:{:016x}", hasher.finish())
    }

    /// Clears the global model cache.
    pub fn clear_cache() {
        if let Ok(mut cache) = get_model_cache().lock() {
            cache.clear();
            tracing::info!("Model cache cleared");
        }
    }

    /// Returns the number of cached models.
    pub fn cache_size() -> usize {
        get_model_cache().lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Convert f32 embeddings to f16, normalizing first when configured
    fn convert_to_f16(&self, embeddings: Vec<Vec<f32>>) -> Vec<Vec<f16>> {
        embeddings
            .into_iter()
            .map(|mut embedding| {
                if self.config.normalize {
                    l2_normalize(&mut embedding);
                }
                embedding.into_iter().map(f16::from_f32).collect()
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        let model = self.model.as_ref().ok_or_else(|| {
            EmbedError::invalid_config("Model not initialized. Call initialize() first.")
        })?;

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        // Every batch must succeed; a failure discards what was already computed
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            let batch = batch.to_vec();
            let model_clone = Arc::clone(model);

            let batch_embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut model_guard = lock(&model_clone)?;
                model_guard
                    .embed(batch, None)
                    .map_err(|e| EmbedError::unavailable(e.to_string()))
            })
            .await??;

            all_embeddings.extend(self.convert_to_f16(batch_embeddings));
        }

        let result = EmbeddingResult::new(all_embeddings);
        result.validate(texts.len(), self.dimension)?;

        tracing::debug!("Generated {} embeddings", result.len());
        Ok(result)
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_result() {
        let embeddings = vec![
            vec![f16::from_f32(0.1), f16::from_f32(0.2), f16::from_f32(0.3)],
            vec![f16::from_f32(0.4), f16::from_f32(0.5), f16::from_f32(0.6)],
        ];
        let result = EmbeddingResult::new(embeddings);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
        assert!(result.validate(2, 3).is_ok());
        assert!(matches!(
            result.validate(3, 3),
            Err(EmbedError::BatchSizeMismatch { inputs: 3, outputs: 2 })
        ));
        assert!(matches!(
            result.validate(2, 4),
            Err(EmbedError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_l2_normalize() {
        let mut values = vec![3.0, 4.0];
        l2_normalize(&mut values);
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);

        let mut zeros = vec![0.0, 0.0];
        l2_normalize(&mut zeros);
        assert_eq!(zeros, vec![0.0, 0.0]);
    }

    #[test]
    fn test_fastembed_provider_creation() {
        let provider = FastEmbedProvider::new(EmbedConfig::fastembed("all-minilm-l6-v2"));
        assert!(provider.model.is_none());
        assert_eq!(provider.provider_name(), "fastembed");
    }

    #[test]
    fn test_unknown_builtin_model() {
        assert!(builtin_model("all-MiniLM-L6-v2").is_ok());
        assert!(matches!(
            builtin_model("gpt-embedding"),
            Err(EmbedError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_cache_key_generation() {
        let key1 = FastEmbedProvider::new(EmbedConfig::fastembed("bge-small-en-v1.5")).create_cache_key();
        let key2 = FastEmbedProvider::new(
            EmbedConfig::fastembed("bge-small-en-v1.5").with_batch_size(4),
        )
        .create_cache_key();
        let key3 = FastEmbedProvider::new(EmbedConfig::fastembed("all-minilm-l6-v2")).create_cache_key();

        assert_eq!(key1, key2, "Batch size should not change the cache key");
        assert_ne!(key1, key3, "Different model name should produce different cache key");
        assert!(key1.starts_with("v1:"), "Cache key should have version prefix");
    }

    #[tokio::test]
    async fn test_uninitialized_provider_rejects_embedding() {
        let provider = FastEmbedProvider::new(EmbedConfig::fastembed("all-minilm-l6-v2"));
        let err = provider
            .embed_texts(&["hello".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));

        let empty = provider.embed_texts(&[]).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    #[ignore] // Integration test: downloads a real model - run with: cargo test -- --ignored
    async fn test_fastembed_embedding_roundtrip() -> Result<()> {
        let provider = FastEmbedProvider::create(EmbedConfig::fastembed("all-minilm-l6-v2")).await?;
        assert_eq!(provider.embedding_dimension(), 384);

        let texts = vec![
            "The sky is blue.".to_string(),
            "Grass is green.".to_string(),
        ];
        let result = provider.embed_texts(&texts).await?;
        assert_eq!(result.len(), 2);
        assert!(
            result.embeddings[0]
                .iter()
                .all(|x| x.to_f32().is_finite())
        );

        FastEmbedProvider::clear_cache();
        assert_eq!(FastEmbedProvider::cache_size(), 0);
        Ok(())
    }
}
