//! Text-to-vector embedding.
//!
//! Provides the [`EmbeddingProvider`] trait with two implementations: an
//! offline feature-hashing provider and an OpenAI-compatible HTTP provider.
//! The provider is created via [`create_provider`] from configuration.

pub mod hashing;
pub mod http;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`dimensions`](Self::dimensions) entries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched requests.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Identifier recorded in the database so vectors from different models never mix.
    fn model_id(&self) -> &str;
}

/// Create an embedding provider from config.
///
/// `"hashing"` needs no network or model files; `"http"` calls an
/// OpenAI-compatible `/embeddings` endpoint.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Box::new(hashing::HashingEmbeddingProvider::new(config.dimensions)?)),
        "http" => Ok(Box::new(http::HttpEmbeddingProvider::new(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: hashing, http"),
    }
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;

    #[test]
    fn create_provider_rejects_unknown() {
        let config = EmbeddingConfig {
            provider: "onnx".into(),
            ..EmbeddingConfig::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn default_provider_is_hashing() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dimensions(), 384);
        assert_eq!(provider.model_id(), "feature-hash-v1");
    }

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0f32; 3];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);
    }
}
