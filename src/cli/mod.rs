//! Terminal subcommands: one-shot questions and bulk indexing.

pub mod ask;
pub mod ingest;

pub use ask::{ask, AskOptions};
pub use ingest::{ingest, IngestOptions};
