//! MCP `iterative_search` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::QuarryConfig;
use crate::rag::types::ContextKind;
use crate::rag::{ContextOptions, IterativeSearchArgs};

/// Parameters for the `iterative_search` MCP tool.
///
/// Every field except `query` falls back to configuration.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct IterativeSearchParams {
    #[schemars(description = "The question to answer from the indexed codebase")]
    pub query: String,

    #[schemars(description = "Agent whose knowledge base to search. Defaults to the configured agent.")]
    pub agent_id: Option<String>,

    #[schemars(description = "Model override for oracle calls")]
    pub model: Option<String>,

    #[schemars(description = "Maximum decision turns (1-8). Defaults to 5.")]
    pub max_iterations: Option<usize>,

    #[schemars(description = "Maximum results per retrieval call")]
    pub max_results: Option<usize>,

    #[schemars(
        description = "Restrict retrieval to these kinds: function, method, class, file, documentation, graph-node, generic-chunk"
    )]
    pub kinds: Option<Vec<String>>,

    #[schemars(description = "Drop retrieved items below this relevance (0.0-1.0)")]
    pub min_relevance: Option<f64>,

    #[schemars(description = "Fuse vector, keyword, and graph retrieval. Defaults to true.")]
    pub hybrid_search: Option<bool>,

    #[schemars(description = "Ask the model to pick a retrieval strategy up front. Defaults to false.")]
    pub agentic_planning: Option<bool>,

    #[schemars(description = "Periodically reflect on gaps in the gathered context. Defaults to false.")]
    pub reflection: Option<bool>,

    #[schemars(description = "Allow web search when the codebase is not enough. Defaults to on when configured.")]
    pub web_search: Option<bool>,

    #[schemars(description = "Split long items into chunks before prompting. Defaults to true.")]
    pub long_context_chunking: Option<bool>,

    #[schemars(description = "Rewrite the query when the quality gate rejects an answer. Defaults to true.")]
    pub corrective_search: Option<bool>,

    #[schemars(description = "Reflect every N turns. Defaults to 2.")]
    pub reflection_frequency: Option<usize>,

    #[schemars(description = "Chunk size in characters for long-context chunking. Defaults to 2000.")]
    pub chunk_size: Option<usize>,

    #[schemars(description = "Minimum citation quality (0.0-1.0) before an answer is accepted")]
    pub citation_accuracy_threshold: Option<f64>,

    #[schemars(description = "If true, omit accumulated context from the response and return only the answer, citations, and metrics")]
    pub summary_only: Option<bool>,
}

impl IterativeSearchParams {
    /// Validate and merge with configuration defaults.
    pub fn into_args(self, config: &QuarryConfig) -> Result<IterativeSearchArgs, String> {
        if self.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        if let Some(r) = self.min_relevance {
            if !(0.0..=1.0).contains(&r) {
                return Err("min_relevance must be between 0.0 and 1.0".into());
            }
        }
        if let Some(t) = self.citation_accuracy_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err("citation_accuracy_threshold must be between 0.0 and 1.0".into());
            }
        }
        let kinds = self
            .kinds
            .map(|kinds| {
                kinds
                    .iter()
                    .map(|k| k.parse::<ContextKind>())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let agent = self
            .agent_id
            .unwrap_or_else(|| config.storage.default_agent.clone());
        let mut args = IterativeSearchArgs::from_config(agent, self.query, config);
        args.model = self.model;
        if let Some(n) = self.max_iterations {
            args.max_iterations = n;
        }
        args.context_options = ContextOptions {
            max_results: self.max_results,
            kinds,
            min_relevance: self.min_relevance,
        };
        let f = &mut args.features;
        f.hybrid_search = self.hybrid_search.unwrap_or(f.hybrid_search);
        f.agentic_planning = self.agentic_planning.unwrap_or(f.agentic_planning);
        f.reflection = self.reflection.unwrap_or(f.reflection);
        f.web_search = self.web_search.unwrap_or(f.web_search);
        f.long_context_chunking = self.long_context_chunking.unwrap_or(f.long_context_chunking);
        f.corrective_search = self.corrective_search.unwrap_or(f.corrective_search);
        if let Some(n) = self.reflection_frequency {
            args.reflection_frequency = n;
        }
        if let Some(n) = self.chunk_size {
            args.chunk_size = n;
        }
        if let Some(t) = self.citation_accuracy_threshold {
            args.citation_accuracy_threshold = t;
        }
        Ok(args)
    }
}
