//! Data model shared by every stage of the iterative search loop.
//!
//! [`RetrievedContext`] is the unit of evidence, [`Citation`] its addressable
//! form, [`Decision`] the oracle's per-turn judgment, and [`SearchMetrics`] the
//! per-run accumulator returned inside [`IterativeRagResult`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What a piece of retrieved evidence represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    Function,
    Method,
    Class,
    File,
    Documentation,
    GraphNode,
    GenericChunk,
}

impl ContextKind {
    pub const ALL: [ContextKind; 7] = [
        Self::Function,
        Self::Method,
        Self::Class,
        Self::File,
        Self::Documentation,
        Self::GraphNode,
        Self::GenericChunk,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::File => "file",
            Self::Documentation => "documentation",
            Self::GraphNode => "graph-node",
            Self::GenericChunk => "generic-chunk",
        }
    }

    /// Tie-break rank used when ordering equally relevant items; lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::GraphNode => 0,
            Self::Function => 1,
            Self::Method => 2,
            Self::Class => 3,
            Self::File => 4,
            Self::Documentation => 5,
            Self::GenericChunk => 6,
        }
    }
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContextKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(Self::Function),
            "method" => Ok(Self::Method),
            "class" => Ok(Self::Class),
            "file" => Ok(Self::File),
            "documentation" => Ok(Self::Documentation),
            "graph-node" | "graph_node" => Ok(Self::GraphNode),
            "generic-chunk" | "generic_chunk" | "chunk" => Ok(Self::GenericChunk),
            _ => Err(format!("unknown context kind: {s}")),
        }
    }
}

/// Retrieval channel that produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchChannel {
    Vector,
    Keyword,
    Graph,
    Web,
}

impl SearchChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Graph => "graph",
            Self::Web => "web",
        }
    }
}

impl std::fmt::Display for SearchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a chunk produced by the flow builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub total: usize,
}

/// Structured, optional metadata attached to retrieved evidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<SearchChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

/// A unit of evidence returned by a retrieval channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedContext {
    pub kind: ContextKind,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub content: String,
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContextMetadata>,
}

impl RetrievedContext {
    pub fn new(kind: ContextKind, source_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            source_path: source_path.into(),
            entity_name: None,
            content: content.into(),
            relevance_score: 0.0,
            metadata: None,
        }
    }

    pub fn with_entity(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = score;
        self
    }

    /// Identity used for deduplication: `sourcePath + entityName`.
    ///
    /// The path is length-prefixed, so no choice of separator characters in
    /// either field can make two different pairs collide.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}{}",
            self.source_path.len(),
            self.source_path,
            self.entity_name.as_deref().unwrap_or_default()
        )
    }

    /// Mutable metadata, created on first access.
    pub fn metadata_mut(&mut self) -> &mut ContextMetadata {
        self.metadata.get_or_insert_with(ContextMetadata::default)
    }

    pub fn line_range(&self) -> Option<LineRange> {
        let meta = self.metadata.as_ref()?;
        match (meta.start_line, meta.end_line) {
            (Some(start), Some(end)) => Some(LineRange { start, end }),
            (Some(start), None) => Some(LineRange { start, end: start }),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<ChunkInfo> {
        self.metadata.as_ref().and_then(|m| m.chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

/// Addressable record derived from a [`RetrievedContext`] the first time it is accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// 1-based, append-only, never renumbered.
    pub id: usize,
    pub source: String,
    pub source_type: ContextKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_range: Option<LineRange>,
    pub confidence: f64,
    pub relevance_score: f64,
    pub extracted_text: String,
}

/// The three actions the oracle may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Answer,
    SearchAgain,
    SearchWeb,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answer => "ANSWER",
            Self::SearchAgain => "SEARCH_AGAIN",
            Self::SearchWeb => "SEARCH_WEB",
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "ANSWER" => Ok(Self::Answer),
            "SEARCH_AGAIN" => Ok(Self::SearchAgain),
            "SEARCH_WEB" => Ok(Self::SearchWeb),
            _ => Err(s.to_string()),
        }
    }
}

/// The oracle's validated judgment for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub decision: DecisionKind,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_codebase_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_web_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

/// How context is gathered for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Dense retrieval only.
    Vector,
    /// Keyword retrieval only.
    Keyword,
    /// Vector + keyword fused, graph when recommended.
    Hybrid,
    /// Vector + keyword + graph fused.
    Graph,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
            Self::Graph => "graph",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" | "semantic" | "dense" => Ok(Self::Vector),
            "keyword" | "lexical" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            "graph" | "knowledge_graph" => Ok(Self::Graph),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Strategy recommendation produced by agentic planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticPlan {
    pub strategy: Strategy,
    pub auxiliary_queries: Vec<String>,
    pub use_graph: bool,
    pub reasoning: String,
}

/// Outcome of a mid-run reflection over the accumulated context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub turn: usize,
    pub assessment: String,
    pub gaps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    pub title: String,
    pub url: String,
    pub content: String,
}

/// One entry of the decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub turn: usize,
    pub decision: DecisionKind,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_query: Option<String>,
    /// The quality gate converted an ANSWER into another search.
    pub overridden: bool,
}

/// Per-turn audit entry inside [`SearchMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnLog {
    pub turn: usize,
    pub queries: Vec<String>,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    pub new_context_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetrics {
    pub total_iterations: usize,
    pub context_items_added: usize,
    pub web_searches_performed: usize,
    pub self_correction_loops: usize,
    pub citation_accuracy: f64,
    pub citation_coverage: f64,
    pub citation_quality: f64,
    pub quality_score: f64,
    pub source_diversity: f64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub turns: Vec<TurnLog>,
    pub termination_reason: String,
}

/// Optional caller overrides for retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    pub max_results: Option<usize>,
    pub kinds: Option<Vec<ContextKind>>,
    pub min_relevance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    pub hybrid_search: bool,
    pub agentic_planning: bool,
    pub reflection: bool,
    pub web_search: bool,
    pub long_context_chunking: bool,
    pub corrective_search: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            hybrid_search: true,
            agentic_planning: false,
            reflection: false,
            web_search: false,
            long_context_chunking: true,
            corrective_search: true,
        }
    }
}

/// Input to [`Orchestrator::perform_iterative_search`](super::Orchestrator::perform_iterative_search).
#[derive(Debug, Clone, PartialEq)]
pub struct IterativeSearchArgs {
    pub agent_id: String,
    pub query: String,
    pub model: Option<String>,
    /// Clamped to `[1, orchestrator.max_iterations_cap]`.
    pub max_iterations: usize,
    pub context_options: ContextOptions,
    pub features: FeatureFlags,
    pub reflection_frequency: usize,
    pub chunk_size: usize,
    pub citation_accuracy_threshold: f64,
}

impl IterativeSearchArgs {
    pub fn new(agent_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            query: query.into(),
            model: None,
            max_iterations: 5,
            context_options: ContextOptions::default(),
            features: FeatureFlags::default(),
            reflection_frequency: 2,
            chunk_size: 2000,
            citation_accuracy_threshold: 0.65,
        }
    }

    /// Like [`new`](Self::new), with defaults taken from configuration.
    /// Web search is on whenever a web provider is configured.
    pub fn from_config(
        agent_id: impl Into<String>,
        query: impl Into<String>,
        config: &crate::config::QuarryConfig,
    ) -> Self {
        let mut args = Self::new(agent_id, query);
        args.max_iterations = config.orchestrator.default_max_iterations;
        args.reflection_frequency = config.orchestrator.reflection_frequency;
        args.chunk_size = config.orchestrator.chunk_size;
        args.citation_accuracy_threshold = config.quality.citation_threshold;
        args.features.web_search = config.web_search.enabled;
        args
    }
}

/// Everything an iterative search run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterativeRagResult {
    pub accumulated_context: Vec<RetrievedContext>,
    pub web_search_sources: Vec<WebSource>,
    pub final_answer: String,
    pub decision_log: Vec<DecisionRecord>,
    pub citations: Vec<Citation>,
    pub reflection_results: Vec<Reflection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_plan: Option<AgenticPlan>,
    pub search_metrics: SearchMetrics,
}
