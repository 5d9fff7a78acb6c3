//! Service wiring and MCP server entry points for stdio and HTTP transports.
//!
//! [`build_services`] opens the database and assembles the knowledge store,
//! oracle, optional web search, and orchestrator. [`serve_stdio`] and
//! [`serve_http`] put the MCP tool handler in front of them.

use crate::config::QuarryConfig;
use crate::db::{self, EmbeddingMeta};
use crate::embedding;
use crate::knowledge::SqliteKnowledgeStore;
use crate::providers::oracle::ChatOracle;
use crate::providers::web::TavilySearch;
use crate::rag::{Orchestrator, OrchestratorSettings};
use crate::tools::QuarryTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::{Arc, Mutex};

/// Everything a request handler needs, shared behind `Arc`s.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<SqliteKnowledgeStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<QuarryConfig>,
}

/// Open the DB, create the embedding provider, and wire the orchestrator.
pub fn build_services(config: QuarryConfig) -> Result<Services> {
    let provider = embedding::create_provider(&config.embedding)?;
    let embedding: Arc<dyn embedding::EmbeddingProvider> = Arc::from(provider);
    let meta = EmbeddingMeta {
        model: embedding.model_id().to_string(),
        dimensions: embedding.dimensions(),
    };
    tracing::info!(model = %meta.model, dimensions = meta.dimensions, "embedding provider ready");

    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, &meta)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let store = Arc::new(SqliteKnowledgeStore::new(Arc::new(Mutex::new(conn)), embedding));
    let oracle = Arc::new(ChatOracle::new(&config.oracle)?);
    if config.oracle.api_key.trim().is_empty() {
        tracing::warn!("oracle.api_key is not set; searches will end with a fallback summary");
    }

    let settings = OrchestratorSettings::from_config(&config);
    let mut orchestrator = Orchestrator::new(store.clone(), oracle, settings).with_graph(store.clone());

    if config.web_search.enabled {
        match TavilySearch::new(&config.web_search) {
            Ok(web) => {
                orchestrator = orchestrator.with_web_search(Arc::new(web));
                tracing::info!("web search enabled");
            }
            Err(e) => tracing::warn!(error = %e, "web search disabled"),
        }
    }

    Ok(Services {
        store,
        orchestrator: Arc::new(orchestrator),
        config: Arc::new(config),
    })
}

impl Services {
    fn tools(&self) -> QuarryTools {
        QuarryTools::new(
            self.store.clone(),
            self.orchestrator.clone(),
            self.config.clone(),
        )
    }
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: QuarryConfig) -> Result<()> {
    tracing::info!("starting Quarry MCP server on stdio");

    let services = build_services(config)?;
    let transport = rmcp::transport::stdio();

    let server = services.tools().serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP transport.
pub async fn serve_http(config: QuarryConfig) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let bind_addr = format!("{host}:{port}");

    tracing::info!(addr = %bind_addr, "starting Quarry MCP server on HTTP");

    let services = build_services(config)?;

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(services.tools()),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    Ok(())
}
