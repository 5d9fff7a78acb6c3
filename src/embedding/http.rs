//! OpenAI-compatible `/embeddings` provider.

use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{l2_normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;

pub struct HttpEmbeddingProvider {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        ensure!(
            !config.api_key.trim().is_empty(),
            "embedding provider \"http\" needs embedding.api_key"
        );
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build embedding client")?;
        Ok(Self {
            client,
            url: format!("{}{}", config.api_base.trim_end_matches('/'), config.path),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().context("embedding response was empty")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimensions,
        });
        let res = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("embedding request failed")?;
        let json: Value = res.error_for_status()?.json().await?;

        let vectors = parse_embedding_response(&json)?;
        ensure!(
            vectors.len() == texts.len(),
            "embedding response has {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        );
        vectors
            .into_iter()
            .map(|mut v| {
                if v.len() != self.dimensions {
                    bail!("expected {} dimensions, got {}", self.dimensions, v.len());
                }
                l2_normalize(&mut v);
                Ok(v)
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Parse `data[].{index, embedding}` into vectors ordered by `index`.
fn parse_embedding_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .context("embedding response is missing data array")?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let values = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .context("embedding item missing embedding array")?;
        let vector = values
            .iter()
            .map(|v| v.as_f64().map(|n| n as f32).context("embedding value must be numeric"))
            .collect::<Result<Vec<f32>>>()?;
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
