//! Codebase memory for AI agents, with an iterative retrieval-augmented answer loop.
//!
//! Quarry is an [MCP](https://modelcontextprotocol.io/) server. Agents index
//! code and documentation into a local knowledge base, link related items into
//! a graph, and ask questions. Each question runs a bounded loop: retrieve,
//! let a language model judge whether the evidence suffices, check its answer
//! against quality and citation gates, and either answer or search again.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search,
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search, and an
//!   edge table for the relation graph
//! - **Embeddings**: offline feature hashing by default, or any
//!   OpenAI-compatible `/embeddings` endpoint
//! - **Retrieval**: vector, keyword, and graph channels fused with weighted
//!   Reciprocal Rank Fusion
//! - **Oracle**: OpenAI-compatible chat completions; optional Tavily web search
//! - **Transport**: MCP over stdio (primary) or Streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`db`]: database initialization and schema
//! - [`embedding`]: text-to-vector providers
//! - [`knowledge`]: the SQLite knowledge store (index, search, graph)
//! - [`providers`]: collaborator traits and their HTTP implementations
//! - [`rag`]: the iterative search orchestrator and its stages
//! - [`tools`] and [`server`]: the MCP surface
//! - [`cli`]: terminal subcommands

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod knowledge;
pub mod providers;
pub mod rag;
pub mod server;
pub mod tools;
