//! SQL DDL for the knowledge store.
//!
//! Defines the `contexts`, `contexts_fts` (FTS5), `contexts_vec` (vec0),
//! `context_edges`, and `schema_meta` tables. All DDL uses `IF NOT EXISTS`
//! for idempotent initialization.

use rusqlite::Connection;

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
-- Indexed context items, one row per (agent, source path, entity)
CREATE TABLE IF NOT EXISTS contexts (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('function','method','class','file','documentation','graph-node','generic-chunk')),
    source_path TEXT NOT NULL,
    entity_name TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    start_line INTEGER,
    end_line INTEGER,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(agent_id, source_path, entity_name)
);

CREATE INDEX IF NOT EXISTS idx_contexts_agent ON contexts(agent_id);
CREATE INDEX IF NOT EXISTS idx_contexts_kind ON contexts(kind);
CREATE INDEX IF NOT EXISTS idx_contexts_entity ON contexts(entity_name);

-- Full-text search (BM25) over content, entity names, and paths
CREATE VIRTUAL TABLE IF NOT EXISTS contexts_fts USING fts5(
    content,
    entity_name,
    source_path,
    id UNINDEXED,
    content='contexts',
    content_rowid='rowid'
);

-- Directed relation graph between context items
CREATE TABLE IF NOT EXISTS context_edges (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    source_id TEXT NOT NULL REFERENCES contexts(id) ON DELETE CASCADE,
    relation TEXT NOT NULL,
    target_id TEXT NOT NULL REFERENCES contexts(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    UNIQUE(source_id, relation, target_id)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON context_edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON context_edges(target_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all tables. The vec0 table is sized to `dimensions`.
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 column sizes are part of the DDL, so this one is formatted.
    // Partitioning on agent keeps KNN scoped to one knowledge base.
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS contexts_vec USING vec0(\n\
         id TEXT PRIMARY KEY,\n\
         agent_id TEXT PARTITION KEY,\n\
         embedding FLOAT[{dimensions}]\n\
         );"
    ))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 16).unwrap();

        let tables = tables(&conn);
        for name in ["contexts", "contexts_fts", "contexts_vec", "context_edges", "schema_meta"] {
            assert!(tables.contains(&name.to_string()), "missing table {name}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 16).unwrap();
        init_schema(&conn, 16).unwrap();
    }

    #[test]
    fn kind_check_rejects_unknown_values() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 16).unwrap();
        let result = conn.execute(
            "INSERT INTO contexts (id, agent_id, kind, source_path, content, created_at, updated_at) \
             VALUES ('x', 'a', 'episodic', 'p', 'c', 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
