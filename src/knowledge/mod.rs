//! SQLite-backed knowledge store.
//!
//! [`SqliteKnowledgeStore`] owns the shared connection and the embedding
//! provider. Embedding happens on the async side; SQL runs on the blocking
//! pool. It implements both [`ContextRetriever`] and [`GraphQuery`].

pub mod index;
pub mod search;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;

use crate::embedding::EmbeddingProvider;
use crate::providers::{
    ContextRetriever, GraphQuery, GraphQueryResult, RetrievalMode, RetrievalOptions,
};
use crate::rag::RetrievedContext;

pub use index::{ContextRef, IndexOutcome, LinkOutcome, NewContext};

#[derive(Clone)]
pub struct SqliteKnowledgeStore {
    db: Arc<Mutex<Connection>>,
    embedding: Arc<dyn EmbeddingProvider>,
}

impl SqliteKnowledgeStore {
    pub fn new(db: Arc<Mutex<Connection>>, embedding: Arc<dyn EmbeddingProvider>) -> Self {
        Self { db, embedding }
    }

    pub fn embedding(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedding
    }

    /// Embed and store one item, replacing any item with the same key.
    pub async fn index_context(&self, agent_id: &str, item: NewContext) -> Result<IndexOutcome> {
        let vector = self
            .embedding
            .embed(&item.embedding_text())
            .await
            .context("embedding failed")?;
        let agent = agent_id.to_string();
        let outcome = self
            .with_conn(move |conn| index::upsert_context(conn, &agent, &item, &vector))
            .await?;
        tracing::debug!(id = %outcome.id, created = outcome.created, "context indexed");
        Ok(outcome)
    }

    /// Embed and store a batch of items with one provider call.
    pub async fn index_batch(&self, agent_id: &str, items: Vec<NewContext>) -> Result<Vec<IndexOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = items.iter().map(NewContext::embedding_text).collect();
        let vectors = self
            .embedding
            .embed_batch(&texts)
            .await
            .context("embedding failed")?;
        let agent = agent_id.to_string();
        self.with_conn(move |conn| {
            items
                .iter()
                .zip(&vectors)
                .map(|(item, vector)| index::upsert_context(conn, &agent, item, vector))
                .collect()
        })
        .await
    }

    pub async fn link_context(
        &self,
        agent_id: &str,
        source: ContextRef,
        relation: &str,
        target: ContextRef,
    ) -> Result<LinkOutcome> {
        let agent = agent_id.to_string();
        let relation = relation.to_string();
        self.with_conn(move |conn| index::link_contexts(conn, &agent, &source, &relation, &target))
            .await
    }

    pub async fn count(&self, agent_id: &str) -> Result<usize> {
        let agent = agent_id.to_string();
        self.with_conn(move |conn| index::count_contexts(conn, &agent)).await
    }

    /// Run `f` against the locked connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .context("db task failed")?
    }
}

#[async_trait]
impl ContextRetriever for SqliteKnowledgeStore {
    async fn retrieve_context(
        &self,
        agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievedContext>> {
        let agent = agent_id.to_string();
        let opts = options.clone();
        match options.mode {
            RetrievalMode::Vector => {
                let vector = self.embedding.embed(query).await.context("embedding failed")?;
                self.with_conn(move |conn| search::vector_search(conn, &agent, &vector, &opts))
                    .await
            }
            RetrievalMode::Keyword => {
                let query = query.to_string();
                self.with_conn(move |conn| search::keyword_search(conn, &agent, &query, &opts))
                    .await
            }
        }
    }
}

#[async_trait]
impl GraphQuery for SqliteKnowledgeStore {
    async fn query_graph(&self, agent_id: &str, query: &str) -> Result<GraphQueryResult> {
        let agent = agent_id.to_string();
        let query = query.to_string();
        let nodes = self
            .with_conn(move |conn| search::graph_search(conn, &agent, &query))
            .await?;
        Ok(GraphQueryResult { nodes })
    }
}
