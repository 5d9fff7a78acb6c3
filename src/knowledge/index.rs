//! Write path: upsert context items and record graph edges.
//!
//! Every write runs inside a transaction that keeps `contexts`,
//! `contexts_fts`, and `contexts_vec` in step.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::db::embedding_to_bytes;
use crate::rag::types::ContextKind;

/// A context item to index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContext {
    pub kind: ContextKind,
    pub source_path: String,
    pub entity_name: Option<String>,
    pub content: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

impl NewContext {
    pub fn new(kind: ContextKind, source_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            source_path: source_path.into(),
            entity_name: None,
            content: content.into(),
            start_line: None,
            end_line: None,
            metadata: None,
        }
    }

    pub fn with_entity(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_lines(mut self, start: u32, end: u32) -> Self {
        self.start_line = Some(start);
        self.end_line = Some(end);
        self
    }

    /// Text handed to the embedding provider: entity and path give short
    /// snippets enough vocabulary to be found.
    pub fn embedding_text(&self) -> String {
        match self.entity_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("{name} {}\n{}", self.source_path, self.content),
            None => format!("{}\n{}", self.source_path, self.content),
        }
    }
}

/// Result of [`upsert_context`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexOutcome {
    pub id: String,
    /// `false` when an existing `(agent, path, entity)` row was replaced.
    pub created: bool,
}

/// Addresses an indexed item by its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContextRef {
    #[schemars(description = "Source path of the indexed item")]
    pub source_path: String,
    #[schemars(description = "Entity name of the indexed item; omit for whole-file items")]
    #[serde(default)]
    pub entity_name: Option<String>,
}

/// Result of [`link_contexts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub id: String,
    /// `false` when the same edge already existed.
    pub created: bool,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Insert a context item, or replace the one with the same
/// `(agent, source path, entity)` key.
pub fn upsert_context(
    conn: &mut Connection,
    agent_id: &str,
    item: &NewContext,
    embedding: &[f32],
) -> Result<IndexOutcome> {
    if item.content.trim().is_empty() {
        bail!("content must not be empty");
    }
    if item.source_path.trim().is_empty() {
        bail!("source_path must not be empty");
    }

    let entity = item.entity_name.as_deref().unwrap_or_default();
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();
    let metadata_json = item.metadata.as_ref().map(serde_json::to_string).transpose()?;

    let existing: Option<(i64, String, String, String)> = tx
        .query_row(
            "SELECT rowid, id, content, entity_name FROM contexts \
             WHERE agent_id = ?1 AND source_path = ?2 AND entity_name = ?3",
            params![agent_id, item.source_path, entity],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let outcome = match existing {
        Some((rowid, id, old_content, old_entity)) => {
            delete_fts(&tx, rowid, &old_content, &old_entity, &item.source_path, &id)?;
            tx.execute(
                "UPDATE contexts SET kind = ?1, content = ?2, start_line = ?3, end_line = ?4, \
                 metadata = ?5, updated_at = ?6 WHERE id = ?7",
                params![
                    item.kind.as_str(),
                    item.content,
                    item.start_line,
                    item.end_line,
                    metadata_json,
                    now,
                    id,
                ],
            )?;
            insert_fts(&tx, rowid, &item.content, entity, &item.source_path, &id)?;
            tx.execute("DELETE FROM contexts_vec WHERE id = ?1", params![id])?;
            insert_vec(&tx, &id, agent_id, embedding)?;
            IndexOutcome { id, created: false }
        }
        None => {
            let id = uuid::Uuid::now_v7().to_string();
            tx.execute(
                "INSERT INTO contexts (id, agent_id, kind, source_path, entity_name, content, \
                 start_line, end_line, metadata, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    id,
                    agent_id,
                    item.kind.as_str(),
                    item.source_path,
                    entity,
                    item.content,
                    item.start_line,
                    item.end_line,
                    metadata_json,
                    now,
                ],
            )?;
            let rowid = tx.last_insert_rowid();
            insert_fts(&tx, rowid, &item.content, entity, &item.source_path, &id)?;
            insert_vec(&tx, &id, agent_id, embedding)?;
            IndexOutcome { id, created: true }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

/// Record a directed `source -[relation]-> target` edge between two indexed
/// items of the same agent. Idempotent on the triple.
pub fn link_contexts(
    conn: &mut Connection,
    agent_id: &str,
    source: &ContextRef,
    relation: &str,
    target: &ContextRef,
) -> Result<LinkOutcome> {
    let relation = relation.trim();
    if relation.is_empty() {
        bail!("relation must not be empty");
    }

    let tx = conn.transaction()?;
    let source_id = resolve_ref(&tx, agent_id, source, "source")?;
    let target_id = resolve_ref(&tx, agent_id, target, "target")?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM context_edges WHERE source_id = ?1 AND relation = ?2 AND target_id = ?3",
            params![source_id, relation, target_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        tx.commit()?;
        return Ok(LinkOutcome { id, created: false });
    }

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO context_edges (id, agent_id, source_id, relation, target_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, agent_id, source_id, relation, target_id, now],
    )?;
    tx.commit()?;

    Ok(LinkOutcome { id, created: true })
}

/// Number of indexed items for an agent.
pub fn count_contexts(conn: &Connection, agent_id: &str) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM contexts WHERE agent_id = ?1",
        params![agent_id],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

// ── Internals ─────────────────────────────────────────────────────────────────

fn resolve_ref(tx: &Transaction, agent_id: &str, r: &ContextRef, role: &str) -> Result<String> {
    let entity = r.entity_name.as_deref().unwrap_or_default();
    let id: Option<String> = tx
        .query_row(
            "SELECT id FROM contexts WHERE agent_id = ?1 AND source_path = ?2 AND entity_name = ?3",
            params![agent_id, r.source_path, entity],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => Ok(id),
        None if entity.is_empty() => bail!("{role} not indexed: {}", r.source_path),
        None => bail!("{role} not indexed: {} ({entity})", r.source_path),
    }
}

/// Must use the same rowid as the corresponding `contexts` row.
fn insert_fts(
    tx: &Transaction,
    rowid: i64,
    content: &str,
    entity: &str,
    source_path: &str,
    id: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO contexts_fts (rowid, content, entity_name, source_path, id) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![rowid, content, entity, source_path, id],
    )?;
    Ok(())
}

/// External-content FTS5 deletes need the old column values.
fn delete_fts(
    tx: &Transaction,
    rowid: i64,
    content: &str,
    entity: &str,
    source_path: &str,
    id: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO contexts_fts (contexts_fts, rowid, content, entity_name, source_path, id) \
         VALUES ('delete', ?1, ?2, ?3, ?4, ?5)",
        params![rowid, content, entity, source_path, id],
    )?;
    Ok(())
}

fn insert_vec(tx: &Transaction, id: &str, agent_id: &str, embedding: &[f32]) -> Result<()> {
    tx.execute(
        "INSERT INTO contexts_vec (id, agent_id, embedding) VALUES (?1, ?2, ?3)",
        params![id, agent_id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_memory_database, EmbeddingMeta};

    const DIMS: usize = 16;

    fn test_db() -> Connection {
        open_memory_database(&EmbeddingMeta {
            model: "test".into(),
            dimensions: DIMS,
        })
        .unwrap()
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        v[i] = 1.0;
        v
    }

    fn fts_hits(conn: &Connection, term: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM contexts_fts WHERE contexts_fts MATCH ?1",
            [term],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn insert_then_update_keeps_one_row() {
        let mut conn = test_db();
        let item = NewContext::new(ContextKind::Function, "src/cache.rs", "fn evict() { lru }")
            .with_entity("evict");
        let first = upsert_context(&mut conn, "agent", &item, &axis(0)).unwrap();
        assert!(first.created);

        let changed = NewContext {
            content: "fn evict() { fifo }".into(),
            ..item
        };
        let second = upsert_context(&mut conn, "agent", &changed, &axis(1)).unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);

        assert_eq!(count_contexts(&conn, "agent").unwrap(), 1);
        assert_eq!(fts_hits(&conn, "lru"), 0);
        assert_eq!(fts_hits(&conn, "fifo"), 1);
        let vecs: i64 = conn
            .query_row("SELECT COUNT(*) FROM contexts_vec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(vecs, 1);
    }

    #[test]
    fn agents_are_isolated() {
        let mut conn = test_db();
        let item = NewContext::new(ContextKind::File, "README.md", "hello");
        upsert_context(&mut conn, "a", &item, &axis(0)).unwrap();
        upsert_context(&mut conn, "b", &item, &axis(0)).unwrap();
        assert_eq!(count_contexts(&conn, "a").unwrap(), 1);
        assert_eq!(count_contexts(&conn, "b").unwrap(), 1);
    }

    #[test]
    fn rejects_empty_content() {
        let mut conn = test_db();
        let item = NewContext::new(ContextKind::File, "x.rs", "   ");
        assert!(upsert_context(&mut conn, "a", &item, &axis(0)).is_err());
    }

    #[test]
    fn link_is_idempotent_and_requires_both_ends() {
        let mut conn = test_db();
        let a = NewContext::new(ContextKind::Function, "src/a.rs", "fn a() { b() }").with_entity("a");
        let b = NewContext::new(ContextKind::Function, "src/b.rs", "fn b() {}").with_entity("b");
        upsert_context(&mut conn, "agent", &a, &axis(0)).unwrap();
        upsert_context(&mut conn, "agent", &b, &axis(1)).unwrap();

        let src = ContextRef {
            source_path: "src/a.rs".into(),
            entity_name: Some("a".into()),
        };
        let dst = ContextRef {
            source_path: "src/b.rs".into(),
            entity_name: Some("b".into()),
        };
        let first = link_contexts(&mut conn, "agent", &src, "calls", &dst).unwrap();
        let again = link_contexts(&mut conn, "agent", &src, "calls", &dst).unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.id, again.id);

        let missing = ContextRef {
            source_path: "src/c.rs".into(),
            entity_name: None,
        };
        let err = link_contexts(&mut conn, "agent", &src, "calls", &missing).unwrap_err();
        assert!(err.to_string().contains("target not indexed"));

        // Another agent cannot see these items.
        assert!(link_contexts(&mut conn, "other", &src, "calls", &dst).is_err());
    }
}
