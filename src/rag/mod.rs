//! Iterative retrieval-augmented generation.
//!
//! [`Orchestrator`] drives the loop; the other modules are the stages it
//! calls each turn.

pub mod cache;
pub mod citations;
pub mod decision;
pub mod flow;
pub mod hybrid;
pub mod orchestrator;
pub mod planning;
pub mod prompt;
pub mod quality;
pub mod text;
pub mod types;

pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use types::{
    Citation, ContextKind, ContextOptions, FeatureFlags, IterativeRagResult, IterativeSearchArgs,
    RetrievedContext, SearchMetrics, Strategy,
};
