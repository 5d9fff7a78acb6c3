//! MCP `link_context` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::knowledge::ContextRef;

/// Parameters for the `link_context` MCP tool.
///
/// Creates a directed edge between two indexed items. Idempotent on the
/// (source, relation, target) triple.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LinkContextParams {
    #[schemars(description = "The item the edge starts from")]
    pub source: ContextRef,

    /// Relationship label (e.g. `"calls"`, `"implements"`, `"documented_by"`).
    #[schemars(description = "Relationship label (e.g. 'calls', 'implements', 'documented_by')")]
    pub relation: String,

    #[schemars(description = "The item the edge points to")]
    pub target: ContextRef,

    #[schemars(description = "Agent that owns both items. Defaults to the configured agent.")]
    pub agent_id: Option<String>,
}
