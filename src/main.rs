use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use quarry::cli::{self, AskOptions, IngestOptions};
use quarry::config::QuarryConfig;
use quarry::server;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Codebase memory MCP server with iterative RAG")]
struct Cli {
    /// Config file (defaults to ~/.quarry/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport unless --http)
    Serve {
        /// Serve Streamable HTTP at http://<host>:<port>/mcp
        #[arg(long)]
        http: bool,
    },
    /// Answer a question from the indexed codebase
    Ask {
        query: String,
        /// Agent whose knowledge base to search
        #[arg(long)]
        agent: Option<String>,
        /// Maximum decision turns (1-8)
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Allow web search (needs web_search configured)
        #[arg(long)]
        web: bool,
        /// Let the model choose a retrieval strategy first
        #[arg(long)]
        plan: bool,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Index files and directories into the knowledge base
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Agent that will own the indexed items
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => QuarryConfig::load_from(path)?,
        None => QuarryConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { http } => {
            if http || config.server.transport == "http" {
                server::serve_http(config).await?;
            } else {
                server::serve_stdio(config).await?;
            }
        }
        Command::Ask {
            query,
            agent,
            max_iterations,
            web,
            plan,
            json,
        } => {
            let opts = AskOptions {
                agent,
                max_iterations,
                web,
                planning: plan,
                json,
            };
            cli::ask(config, &query, opts).await?;
        }
        Command::Ingest { paths, agent } => {
            cli::ingest(config, &paths, IngestOptions { agent }).await?;
        }
    }

    Ok(())
}
