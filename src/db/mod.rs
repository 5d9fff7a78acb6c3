pub mod schema;

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Embedding identity a database was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingMeta {
    pub model: String,
    pub dimensions: usize,
}

/// Open (or create) the knowledge database at the given path, with all
/// extensions loaded and schema initialized.
///
/// Fails if the database was built with a different embedding model or
/// dimension count.
pub fn open_database(path: impl AsRef<Path>, embedding: &EmbeddingMeta) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    schema::init_schema(&conn, embedding.dimensions).context("failed to initialize schema")?;
    check_embedding_meta(&conn, embedding)?;

    tracing::info!(path = %path.display(), model = %embedding.model, "database initialized");
    Ok(conn)
}

/// Open an in-memory database, used by tests and one-shot CLI runs.
pub fn open_memory_database(embedding: &EmbeddingMeta) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, embedding.dimensions).context("failed to initialize schema")?;
    check_embedding_meta(&conn, embedding)?;
    Ok(conn)
}

fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Record the embedding identity on first open; reject a mismatch afterwards.
fn check_embedding_meta(conn: &Connection, embedding: &EmbeddingMeta) -> Result<()> {
    let dims = embedding.dimensions.to_string();
    match (get_meta(conn, "embedding_model")?, get_meta(conn, "embedding_dimensions")?) {
        (None, None) => {
            set_meta(conn, "embedding_model", &embedding.model)?;
            set_meta(conn, "embedding_dimensions", &dims)?;
            Ok(())
        }
        (Some(model), Some(stored_dims)) if model == embedding.model && stored_dims == dims => Ok(()),
        (model, stored_dims) => bail!(
            "database was built with embedding model {} ({} dims) but {} ({} dims) is configured; \
             re-index into a fresh database",
            model.as_deref().unwrap_or("?"),
            stored_dims.as_deref().unwrap_or("?"),
            embedding.model,
            dims
        ),
    }
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(model: &str, dimensions: usize) -> EmbeddingMeta {
        EmbeddingMeta {
            model: model.into(),
            dimensions,
        }
    }

    #[test]
    fn embedding_meta_is_recorded_then_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.db");

        drop(open_database(&path, &meta("feature-hash-v1", 32)).unwrap());
        assert!(open_database(&path, &meta("feature-hash-v1", 32)).is_ok());

        let err = open_database(&path, &meta("text-embedding-3-small", 32)).unwrap_err();
        assert!(err.to_string().contains("re-index"));
    }

    #[test]
    fn bytes_cover_every_float() {
        let v = [1.0f32, 2.0, 3.0];
        assert_eq!(embedding_to_bytes(&v).len(), 12);
    }
}
