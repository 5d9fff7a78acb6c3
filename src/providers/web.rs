//! Tavily-style web search client.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config::WebSearchConfig;
use crate::providers::{WebResult, WebSearch, WebSearchOptions};

pub struct TavilySearch {
    client: Client,
    url: String,
    api_key: String,
}

impl TavilySearch {
    pub fn new(config: &WebSearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build web search client")?;
        Ok(Self {
            client,
            url: format!("{}/search", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str, options: &WebSearchOptions) -> Result<Vec<WebResult>> {
        if self.api_key.trim().is_empty() {
            bail!("web search API key not configured (set QUARRY_WEB_API_KEY)");
        }

        let body = serde_json::json!({
            "query": query,
            "search_depth": "basic",
            "max_results": options.max_results,
            "include_answer": false,
            "include_raw_content": false,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("web search request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("web search returned {status}: {}", crate::rag::text::truncate_preview(&text, 200));
        }

        let payload: Value = response.json().await.context("web search body is not JSON")?;
        let results = parse_results(&payload)?;
        tracing::debug!(query, count = results.len(), "web search results");
        Ok(results)
    }
}

/// Parse `results[].{title,url,content,score}`; rows without a URL are skipped.
fn parse_results(payload: &Value) -> Result<Vec<WebResult>> {
    let rows = payload
        .get("results")
        .and_then(|v| v.as_array())
        .context("web search response is missing a results array")?;

    let text = |row: &Value, field: &str| {
        row.get(field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    Ok(rows
        .iter()
        .filter_map(|row| {
            let url = text(row, "url");
            if url.is_empty() {
                return None;
            }
            let title = match text(row, "title") {
                t if t.is_empty() => url.clone(),
                t => t,
            };
            Some(WebResult {
                title,
                url,
                content: text(row, "content"),
                score: row.get("score").and_then(|v| v.as_f64()),
            })
        })
        .collect())
}
