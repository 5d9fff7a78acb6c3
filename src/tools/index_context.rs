//! MCP `index_context` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `index_context` MCP tool.
///
/// Upserts on `(agent_id, source_path, entity_name)`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct IndexContextParams {
    #[schemars(description = "Text to index (source code, documentation, notes)")]
    pub content: String,

    #[schemars(
        description = "Item kind: function, method, class, file, documentation, graph-node, generic-chunk"
    )]
    pub kind: String,

    #[schemars(description = "Path of the file the content comes from")]
    pub source_path: String,

    #[schemars(description = "Name of the function, class, or other entity. Omit for whole files.")]
    pub entity_name: Option<String>,

    #[schemars(description = "Agent that owns this item. Defaults to the configured agent.")]
    pub agent_id: Option<String>,

    #[schemars(description = "First line of the content in the source file")]
    pub start_line: Option<u32>,

    #[schemars(description = "Last line of the content in the source file")]
    pub end_line: Option<u32>,

    #[schemars(description = "Optional JSON metadata blob")]
    pub metadata: Option<serde_json::Value>,
}
