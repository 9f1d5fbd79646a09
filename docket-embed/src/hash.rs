//! Deterministic feature-hashing embeddings.
//!
//! Each lowercase word and each adjacent word pair is hashed into one of
//! `dimension` buckets with a hash-derived sign. Texts that share vocabulary
//! land close together under cosine similarity, which is enough for local
//! use and for tests that must not download model files.

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, l2_normalize};
use async_trait::async_trait;
use fnv::FnvHasher;
use half::f16;
use std::hash::Hasher;

const PAIR_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashEmbedProvider {
    config: EmbedConfig,
}

impl HashEmbedProvider {
    pub fn new(config: EmbedConfig) -> Result<Self> {
        if config.provider != ProviderKind::Hash {
            return Err(EmbedError::invalid_config(
                "HashEmbedProvider requires provider = \"hash\"",
            ));
        }
        config.validate()?;
        Ok(Self { config })
    }

    /// Provider with default settings and the given dimension.
    pub fn with_dimension(dimension: usize) -> Result<Self> {
        Self::new(EmbedConfig::hash(dimension))
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let mut hasher = FnvHasher::default();
        hasher.write(feature.as_bytes());
        let h = hasher.finish();
        let index = (h % self.config.dimension as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    fn embed_one(&self, text: &str) -> Vec<f16> {
        let mut values = vec![0.0f32; self.config.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        for word in &words {
            let (index, sign) = self.bucket(word);
            values[index] += sign;
        }
        for pair in words.windows(2) {
            let (index, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            values[index] += sign * PAIR_WEIGHT;
        }

        if self.config.normalize {
            l2_normalize(&mut values);
        }
        values.into_iter().map(f16::from_f32).collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings: Vec<Vec<f16>> = texts.iter().map(|t| self.embed_one(t)).collect();
        let result = EmbeddingResult {
            embeddings,
            dimension: self.config.dimension,
        };
        result.validate(texts.len(), self.config.dimension)?;
        Ok(result)
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        "hash"
    }
}
