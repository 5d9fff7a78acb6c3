pub mod index_context;
pub mod iterative_search;
pub mod link_context;

use index_context::IndexContextParams;
use iterative_search::IterativeSearchParams;
use link_context::LinkContextParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use std::sync::Arc;

use crate::config::QuarryConfig;
use crate::knowledge::{NewContext, SqliteKnowledgeStore};
use crate::rag::types::ContextKind;
use crate::rag::Orchestrator;

/// The Quarry MCP tool handler. Holds the knowledge store, the orchestrator,
/// and config, and exposes all MCP tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct QuarryTools {
    tool_router: ToolRouter<Self>,
    store: Arc<SqliteKnowledgeStore>,
    orchestrator: Arc<Orchestrator>,
    config: Arc<QuarryConfig>,
}

#[tool_router]
impl QuarryTools {
    pub fn new(
        store: Arc<SqliteKnowledgeStore>,
        orchestrator: Arc<Orchestrator>,
        config: Arc<QuarryConfig>,
    ) -> Self {
        Self {
            tool_router: Self::tool_router(),
            store,
            orchestrator,
            config,
        }
    }

    /// Answer a question by iterating retrieval and model judgment.
    #[tool(description = "Answer a question about the indexed codebase. Iteratively retrieves context (vector, keyword, graph, optionally web), lets the model decide when it has enough, and returns a cited answer with the gathered context and search metrics.")]
    async fn iterative_search(
        &self,
        Parameters(params): Parameters<IterativeSearchParams>,
    ) -> Result<String, String> {
        let summary_only = params.summary_only.unwrap_or(false);
        let args = params.into_args(&self.config)?;

        tracing::info!(
            agent = %args.agent_id,
            query = %args.query,
            max_iterations = args.max_iterations,
            "iterative_search called"
        );

        let mut result = self.orchestrator.perform_iterative_search(args).await;

        tracing::info!(
            iterations = result.search_metrics.total_iterations,
            citations = result.citations.len(),
            reason = %result.search_metrics.termination_reason,
            "iterative_search finished"
        );

        if summary_only {
            result.accumulated_context.clear();
        }
        serde_json::to_string(&result).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Embed and store one context item.
    #[tool(description = "Index a piece of code or documentation so iterative_search can find it. Re-indexing the same (source_path, entity_name) replaces the previous content.")]
    async fn index_context(
        &self,
        Parameters(params): Parameters<IndexContextParams>,
    ) -> Result<String, String> {
        let kind: ContextKind = params.kind.parse().map_err(|e: String| e)?;
        if params.content.trim().is_empty() {
            return Err("content must not be empty".into());
        }
        if params.source_path.trim().is_empty() {
            return Err("source_path must not be empty".into());
        }
        if let (Some(start), Some(end)) = (params.start_line, params.end_line) {
            if start > end {
                return Err("start_line must not exceed end_line".into());
            }
        }

        let agent = params
            .agent_id
            .unwrap_or_else(|| self.config.storage.default_agent.clone());

        tracing::info!(
            agent = %agent,
            kind = %kind,
            source = %params.source_path,
            content_len = params.content.len(),
            "index_context called"
        );

        let item = NewContext {
            kind,
            source_path: params.source_path,
            entity_name: params.entity_name.filter(|n| !n.trim().is_empty()),
            content: params.content,
            start_line: params.start_line,
            end_line: params.end_line,
            metadata: params.metadata,
        };
        let result = self
            .store
            .index_context(&agent, item)
            .await
            .map_err(|e| format!("index failed: {e}"))?;

        serde_json::to_string(&result).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Store a relation between two indexed items.
    #[tool(description = "Create a directed relation between two indexed items (e.g. 'calls', 'implements', 'documented_by'). Graph retrieval follows these edges.")]
    async fn link_context(
        &self,
        Parameters(params): Parameters<LinkContextParams>,
    ) -> Result<String, String> {
        let agent = params
            .agent_id
            .unwrap_or_else(|| self.config.storage.default_agent.clone());

        tracing::info!(
            agent = %agent,
            source = %params.source.source_path,
            relation = %params.relation,
            target = %params.target.source_path,
            "link_context called"
        );

        let result = self
            .store
            .link_context(&agent, params.source, &params.relation, params.target)
            .await
            .map_err(|e| format!("link failed: {e}"))?;

        serde_json::to_string(&result).map_err(|e| format!("serialization failed: {e}"))
    }
}

#[tool_handler]
impl ServerHandler for QuarryTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Quarry answers questions about an indexed codebase. Use index_context and \
                 link_context to build the knowledge base, then iterative_search to ask."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
