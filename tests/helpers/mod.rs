#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quarry::db::{open_memory_database, EmbeddingMeta};
use quarry::embedding::hashing::HashingEmbeddingProvider;
use quarry::knowledge::SqliteKnowledgeStore;
use quarry::providers::{
    ContextRetriever, GraphNode, GraphQuery, GraphQueryResult, Oracle, OracleError, OracleReply,
    OracleRequest, RetrievalMode, RetrievalOptions, WebResult, WebSearch, WebSearchOptions,
};
use quarry::rag::types::ContextKind;
use quarry::rag::{IterativeSearchArgs, OrchestratorSettings, RetrievedContext};

pub const TEST_DIMS: usize = 64;

/// A knowledge store over a fresh in-memory database with hashing embeddings.
pub fn memory_store() -> SqliteKnowledgeStore {
    let provider = HashingEmbeddingProvider::new(TEST_DIMS).unwrap();
    let meta = EmbeddingMeta {
        model: "feature-hash-v1".into(),
        dimensions: TEST_DIMS,
    };
    let conn = open_memory_database(&meta).unwrap();
    SqliteKnowledgeStore::new(Arc::new(Mutex::new(conn)), Arc::new(provider))
}

/// Settings with a short call timeout so slow fakes fail fast.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        call_timeout: Duration::from_millis(500),
        ..OrchestratorSettings::default()
    }
}

pub fn args(query: &str, max_iterations: usize) -> IterativeSearchArgs {
    let mut args = IterativeSearchArgs::new("agent", query);
    args.max_iterations = max_iterations;
    args
}

/// A function item with enough structure to satisfy the quality heuristic.
pub fn function_item(path: &str, name: &str, relevance: f64) -> RetrievedContext {
    RetrievedContext::new(
        ContextKind::Function,
        path,
        format!("fn {name}() {{\n    // cache lookup and eviction\n}}"),
    )
    .with_entity(name)
    .with_relevance(relevance)
}

// ── Decision replies ──────────────────────────────────────────────────────────

pub fn answer(reasoning: &str, confidence: f64) -> Result<String, OracleError> {
    Ok(serde_json::json!({
        "decision": "ANSWER",
        "reasoning": reasoning,
        "confidenceScore": confidence,
    })
    .to_string())
}

pub fn search_again(next: &str) -> Result<String, OracleError> {
    Ok(serde_json::json!({
        "decision": "SEARCH_AGAIN",
        "reasoning": "need more context",
        "nextCodebaseQuery": next,
    })
    .to_string())
}

pub fn search_web(web_query: &str, codebase_query: Option<&str>) -> Result<String, OracleError> {
    Ok(serde_json::json!({
        "decision": "SEARCH_WEB",
        "reasoning": "external docs needed",
        "nextWebQuery": web_query,
        "nextCodebaseQuery": codebase_query,
    })
    .to_string())
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Replays queued replies in order. Once the queue is empty every call gets
/// `fallback`.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<String, OracleError>>>,
    fallback: String,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Result<String, OracleError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: "The cache evicts the oldest entries [1].".into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: &str) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Decision calls are the JSON-mode ones.
    pub fn decision_calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.json_mode)
            .count()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn last_prompt(&self) -> String {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|r| r.prompt.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn ask(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(OracleReply { content }),
            Some(Err(e)) => Err(e),
            None => Ok(OracleReply {
                content: self.fallback.clone(),
            }),
        }
    }
}

/// Never answers within any reasonable deadline.
pub struct StalledOracle {
    pub delay: Duration,
}

#[async_trait]
impl Oracle for StalledOracle {
    async fn ask(&self, _request: OracleRequest) -> Result<OracleReply, OracleError> {
        tokio::time::sleep(self.delay).await;
        Ok(OracleReply {
            content: "too late".into(),
        })
    }
}

// ── Retriever ─────────────────────────────────────────────────────────────────

type Responder =
    Box<dyn Fn(&str, &RetrievalOptions) -> anyhow::Result<Vec<RetrievedContext>> + Send + Sync>;

/// Answers retrieval calls through a closure and logs every call.
pub struct FakeRetriever {
    respond: Responder,
    log: Mutex<Vec<(String, RetrievalMode)>>,
}

impl FakeRetriever {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, &RetrievalOptions) -> anyhow::Result<Vec<RetrievedContext>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            respond: Box::new(respond),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(|_, _| Ok(Vec::new()))
    }

    /// Vector calls pop successive batches; keyword calls return nothing.
    pub fn vector_script(batches: Vec<Vec<RetrievedContext>>) -> Self {
        let queue = Mutex::new(VecDeque::from(batches));
        Self::new(move |_, options| match options.mode {
            RetrievalMode::Vector => Ok(queue.lock().unwrap().pop_front().unwrap_or_default()),
            RetrievalMode::Keyword => Ok(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn queries(&self, mode: RetrievalMode) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| *m == mode)
            .map(|(q, _)| q.clone())
            .collect()
    }
}

#[async_trait]
impl ContextRetriever for FakeRetriever {
    async fn retrieve_context(
        &self,
        _agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> anyhow::Result<Vec<RetrievedContext>> {
        self.log
            .lock()
            .unwrap()
            .push((query.to_string(), options.mode));
        (self.respond)(query, options)
    }
}

// ── Graph ─────────────────────────────────────────────────────────────────────

pub struct FakeGraph {
    pub nodes: Vec<GraphNode>,
    pub calls: AtomicUsize,
}

impl FakeGraph {
    pub fn new(nodes: Vec<GraphNode>) -> Self {
        Self {
            nodes,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphQuery for FakeGraph {
    async fn query_graph(&self, _agent_id: &str, _query: &str) -> anyhow::Result<GraphQueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GraphQueryResult {
            nodes: self.nodes.clone(),
        })
    }
}

pub fn graph_node(name: &str, path: &str, score: f64) -> GraphNode {
    GraphNode {
        id: format!("{path}#{name}"),
        name: name.into(),
        node_type: "function".into(),
        source_path: path.into(),
        content: format!("fn {name}() {{}}"),
        score,
        start_line: Some(1),
        end_line: Some(3),
    }
}

// ── Web ───────────────────────────────────────────────────────────────────────

enum WebBehavior {
    Fixed(Vec<WebResult>),
    /// One result per query, addressed by the query text.
    Echo,
    Fail,
}

pub struct FakeWeb {
    behavior: WebBehavior,
    queries: Mutex<Vec<String>>,
}

impl FakeWeb {
    fn with(behavior: WebBehavior) -> Self {
        Self {
            behavior,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(results: Vec<WebResult>) -> Self {
        Self::with(WebBehavior::Fixed(results))
    }

    pub fn echoing() -> Self {
        Self::with(WebBehavior::Echo)
    }

    pub fn failing() -> Self {
        Self::with(WebBehavior::Fail)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSearch for FakeWeb {
    async fn search(&self, query: &str, _options: &WebSearchOptions) -> anyhow::Result<Vec<WebResult>> {
        self.queries.lock().unwrap().push(query.to_string());
        match &self.behavior {
            WebBehavior::Fixed(results) => Ok(results.clone()),
            WebBehavior::Echo => Ok(vec![web_result(
                query,
                &format!("https://example.com/{}", query.replace(' ', "-")),
            )]),
            WebBehavior::Fail => anyhow::bail!("web provider unavailable"),
        }
    }
}

pub fn web_result(title: &str, url: &str) -> WebResult {
    WebResult {
        title: title.into(),
        url: url.into(),
        content: format!("{title}: documentation about cache eviction policies"),
        score: Some(0.7),
    }
}
