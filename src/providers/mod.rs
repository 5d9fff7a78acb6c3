//! Collaborator interfaces consumed by the orchestrator.
//!
//! The orchestrator never talks to storage, the language model, or the web
//! directly. It goes through these traits:
//!
//! - [`ContextRetriever`]: vector or keyword retrieval from the knowledge store
//! - [`GraphQuery`]: natural-language lookup in the knowledge graph
//! - [`Oracle`]: opaque text-in/text-out language model
//! - [`WebSearch`]: external web search
//!
//! [`oracle::ChatOracle`] and [`web::TavilySearch`] are the HTTP implementations;
//! [`crate::knowledge::SqliteKnowledgeStore`] implements the first two.

pub mod oracle;
pub mod web;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rag::types::ContextKind;
use crate::rag::RetrievedContext;

/// Which index a [`ContextRetriever`] call should hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Vector,
    Keyword,
}

/// Normalized retrieval options handed to a [`ContextRetriever`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub mode: RetrievalMode,
    pub max_results: usize,
    /// Empty means every kind.
    pub kinds: Vec<ContextKind>,
    pub min_relevance: f64,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Vector,
            max_results: 10,
            kinds: Vec::new(),
            min_relevance: 0.0,
        }
    }
}

impl RetrievalOptions {
    pub fn with_mode(&self, mode: RetrievalMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    /// Whether `kind` passes the kind filter.
    pub fn accepts(&self, kind: ContextKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// A node returned by the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub node_type: String,
    pub source_path: String,
    pub content: String,
    pub score: f64,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQueryResult {
    pub nodes: Vec<GraphNode>,
}

/// A language-model request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleRequest {
    pub prompt: String,
    /// Overrides the configured model when set.
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    /// Ask the model for a JSON object reply.
    pub json_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub content: String,
}

/// Failure classes of an oracle call. The orchestrator maps each one to a
/// distinct termination reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("oracle not initialized: {0}")]
    NotInitialized(String),
    #[error("oracle quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("oracle call timed out after {0} ms")]
    Timeout(u64),
    #[error("oracle request failed: {0}")]
    Request(String),
    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSearchOptions {
    pub max_results: usize,
}

impl Default for WebSearchOptions {
    fn default() -> Self {
        Self { max_results: 5 }
    }
}

/// Codebase/document retrieval.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve_context(
        &self,
        agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievedContext>>;
}

/// Knowledge-graph lookup.
#[async_trait]
pub trait GraphQuery: Send + Sync {
    async fn query_graph(&self, agent_id: &str, query: &str) -> Result<GraphQueryResult>;
}

/// Language-model call.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn ask(&self, request: OracleRequest) -> Result<OracleReply, OracleError>;
}

/// External web search.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, options: &WebSearchOptions) -> Result<Vec<WebResult>>;
}

/// Call the oracle under a deadline; an elapsed deadline is [`OracleError::Timeout`].
pub async fn ask_within(
    oracle: &dyn Oracle,
    request: OracleRequest,
    deadline: Duration,
) -> Result<OracleReply, OracleError> {
    match tokio::time::timeout(deadline, oracle.ask(request)).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(deadline.as_millis() as u64)),
    }
}
