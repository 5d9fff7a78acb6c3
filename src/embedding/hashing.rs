//! Offline feature-hashing embeddings.
//!
//! Tokens (lowercased words, identifier parts, and character trigrams) are
//! hashed into a fixed number of signed buckets, then L2-normalized. Texts
//! sharing vocabulary land close together; no model download is needed.

use anyhow::{ensure, Result};
use async_trait::async_trait;

use super::{l2_normalize, EmbeddingProvider};

pub const MODEL_ID: &str = "feature-hash-v1";

/// Trigram features weigh less than whole words.
const TRIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimensions: usize) -> Result<Self> {
        ensure!(dimensions >= 8, "embedding dimensions must be at least 8, got {dimensions}");
        Ok(Self { dimensions })
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in tokens(text) {
            self.add_feature(&mut v, &token, 1.0);
            let chars: Vec<char> = format!("#{token}#").chars().collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                self.add_feature(&mut v, &gram, TRIGRAM_WEIGHT);
            }
        }
        l2_normalize(&mut v);
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let bucket = (h % self.dimensions as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}

/// Lowercased words plus the parts of `snake_case` and `camelCase` identifiers.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if word.is_empty() {
            continue;
        }
        let parts = split_identifier(word);
        if parts.len() > 1 {
            out.extend(parts);
        }
        out.push(word.to_lowercase());
    }
    out
}

fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in word.split('_').filter(|p| !p.is_empty()) {
        let mut current = String::new();
        let mut prev_lower = false;
        for c in piece.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(current.to_lowercase());
                current.clear();
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}

/// 64-bit FNV-1a. Stable across builds, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn vectors_are_unit_length_and_deterministic() {
        let p = HashingEmbeddingProvider::new(384).unwrap();
        let a = p.embed_sync("parse the configuration file");
        let b = p.embed_sync("parse the configuration file");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_is_closer() {
        let p = HashingEmbeddingProvider::new(384).unwrap();
        let query = p.embed_sync("cache eviction policy");
        let near = p.embed_sync("fn evict_oldest removes cache entries by eviction policy");
        let far = p.embed_sync("render the login form with tailwind");
        assert!(cosine(&query, &near) > cosine(&query, &far));
    }

    #[test]
    fn identifiers_split_into_parts() {
        assert_eq!(split_identifier("buildContextFlow"), vec!["build", "context", "flow"]);
        assert_eq!(split_identifier("evict_oldest"), vec!["evict", "oldest"]);
        assert!(tokens("ContextCache").contains(&"cache".to_string()));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let p = HashingEmbeddingProvider::new(16).unwrap();
        assert!(p.embed_sync("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn rejects_tiny_dimensions() {
        assert!(HashingEmbeddingProvider::new(2).is_err());
    }
}
