//! Read path: vector KNN, FTS5 BM25, and relation-graph lookup.
//!
//! All three return provider relevance in `[0, 1]` and filter by agent,
//! kind, and `min_relevance` after fetching an oversized candidate set.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::db::embedding_to_bytes;
use crate::providers::{GraphNode, RetrievalOptions};
use crate::rag::text::query_terms;
use crate::rag::types::{ContextKind, RetrievedContext};

/// Candidates fetched per requested result, before kind/relevance filtering.
const CANDIDATE_FACTOR: usize = 3;

/// sqlite-vec rejects `k` above 4096.
const MAX_KNN: usize = 4096;

/// Cap on direct graph matches; neighbors are added on top.
const GRAPH_SEED_LIMIT: usize = 10;
const GRAPH_NODE_LIMIT: usize = 25;

/// A neighbor's score relative to the node that led to it.
const NEIGHBOR_DECAY: f64 = 0.7;

// ── Internal row struct ───────────────────────────────────────────────────────

struct ContextRow {
    id: String,
    kind: ContextKind,
    source_path: String,
    entity_name: String,
    content: String,
    start_line: Option<u32>,
    end_line: Option<u32>,
}

impl ContextRow {
    const COLUMNS: &'static str =
        "c.id, c.kind, c.source_path, c.entity_name, c.content, c.start_line, c.end_line";

    fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        let kind: String = row.get(offset + 1)?;
        Ok(Self {
            id: row.get(offset)?,
            // The CHECK constraint keeps unknown kinds out of the table.
            kind: kind.parse().unwrap_or(ContextKind::GenericChunk),
            source_path: row.get(offset + 2)?,
            entity_name: row.get(offset + 3)?,
            content: row.get(offset + 4)?,
            start_line: row.get(offset + 5)?,
            end_line: row.get(offset + 6)?,
        })
    }

    fn into_context(self, relevance: f64) -> RetrievedContext {
        let mut ctx = RetrievedContext::new(self.kind, self.source_path, self.content)
            .with_relevance(relevance);
        if !self.entity_name.is_empty() {
            ctx.entity_name = Some(self.entity_name);
        }
        if self.start_line.is_some() || self.end_line.is_some() {
            let meta = ctx.metadata_mut();
            meta.start_line = self.start_line;
            meta.end_line = self.end_line;
        }
        ctx
    }

    fn into_node(self, score: f64) -> GraphNode {
        let name = if self.entity_name.is_empty() {
            self.source_path.clone()
        } else {
            self.entity_name
        };
        GraphNode {
            id: self.id,
            name,
            node_type: self.kind.as_str().to_string(),
            source_path: self.source_path,
            content: self.content,
            score,
            start_line: self.start_line,
            end_line: self.end_line,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Dense retrieval over `contexts_vec`.
///
/// Vectors are unit length, so L2 distance `d` maps to cosine `1 - d²/2`.
/// KNN runs inside the agent's partition. The candidate window grows until
/// `max_results` rows survive the kind and relevance filters or the
/// partition runs out.
pub fn vector_search(
    conn: &Connection,
    agent_id: &str,
    embedding: &[f32],
    options: &RetrievalOptions,
) -> Result<Vec<RetrievedContext>> {
    if options.max_results == 0 {
        return Ok(Vec::new());
    }
    let bytes = embedding_to_bytes(embedding);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM contexts_vec \
         WHERE embedding MATCH ?1 AND k = ?2 AND agent_id = ?3 \
         ORDER BY distance",
    )?;

    let mut k = (options.max_results * CANDIDATE_FACTOR).min(MAX_KNN);
    loop {
        let candidates = stmt
            .query_map(params![bytes, k as i64, agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let exhausted = candidates.len() < k || k >= MAX_KNN;

        let ids: Vec<&str> = candidates.iter().map(|(id, _)| id.as_str()).collect();
        let mut rows = fetch_rows(conn, agent_id, &ids)?;

        let mut out = Vec::new();
        for (id, distance) in &candidates {
            let Some(row) = rows.remove(id) else { continue };
            if !options.accepts(row.kind) {
                continue;
            }
            let relevance = (1.0 - distance * distance / 2.0).clamp(0.0, 1.0);
            if relevance < options.min_relevance {
                continue;
            }
            out.push(row.into_context(relevance));
            if out.len() >= options.max_results {
                break;
            }
        }
        if out.len() >= options.max_results || exhausted {
            return Ok(out);
        }
        k = (k * 2).min(MAX_KNN);
    }
}

/// BM25 retrieval over `contexts_fts`. Terms are OR-ed; relevance is the
/// BM25 score relative to the best hit.
pub fn keyword_search(
    conn: &Connection,
    agent_id: &str,
    query: &str,
    options: &RetrievalOptions,
) -> Result<Vec<RetrievedContext>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() || options.max_results == 0 {
        return Ok(Vec::new());
    }
    let limit = options.max_results * CANDIDATE_FACTOR;

    let sql = format!(
        "SELECT {cols}, contexts_fts.rank FROM contexts_fts \
         JOIN contexts c ON c.rowid = contexts_fts.rowid \
         WHERE contexts_fts MATCH ?1 AND c.agent_id = ?2 \
         ORDER BY contexts_fts.rank LIMIT ?3",
        cols = ContextRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(params![escaped, agent_id, limit as i64], |row| {
            Ok((ContextRow::from_row(row, 0)?, row.get::<_, f64>(7)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // FTS5 rank is negative; more negative is better.
    let best = hits.iter().map(|(_, r)| r.abs()).fold(0.0f64, f64::max);

    let mut out = Vec::new();
    for (row, rank) in hits {
        if !options.accepts(row.kind) {
            continue;
        }
        let relevance = if best > 0.0 { rank.abs() / best } else { 1.0 };
        if relevance < options.min_relevance {
            continue;
        }
        out.push(row.into_context(relevance));
        if out.len() >= options.max_results {
            break;
        }
    }
    Ok(out)
}

/// Match query terms against entity names and paths, then expand one hop
/// along `context_edges` in both directions.
///
/// A direct match scores `0.5 + 0.5 * matched_terms / terms`, or 1.0 when an
/// entity name equals a term. Neighbors inherit [`NEIGHBOR_DECAY`] of the
/// best score that reached them.
pub fn graph_search(conn: &Connection, agent_id: &str, query: &str) -> Result<Vec<GraphNode>> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {cols} FROM contexts c WHERE c.agent_id = ?1 \
         AND (lower(c.entity_name) LIKE ?2 ESCAPE '\\' OR lower(c.source_path) LIKE ?2 ESCAPE '\\')",
        cols = ContextRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut seeds: HashMap<String, (ContextRow, usize, bool)> = HashMap::new();
    for term in &terms {
        let pattern = format!("%{}%", escape_like(term));
        let rows = stmt
            .query_map(params![agent_id, pattern], |row| ContextRow::from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        for row in rows {
            let exact = row.entity_name.eq_ignore_ascii_case(term);
            let entry = seeds.entry(row.id.clone()).or_insert((row, 0, false));
            entry.1 += 1;
            entry.2 |= exact;
        }
    }

    let mut scored: Vec<(ContextRow, f64)> = seeds
        .into_values()
        .map(|(row, matched, exact)| {
            let score = if exact {
                1.0
            } else {
                0.5 + 0.5 * matched as f64 / terms.len() as f64
            };
            (row, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
    scored.truncate(GRAPH_SEED_LIMIT);

    let seed_ids: HashSet<String> = scored.iter().map(|(r, _)| r.id.clone()).collect();
    let mut neighbor_scores: HashMap<String, f64> = HashMap::new();
    for (row, score) in &scored {
        for neighbor in neighbors(conn, &row.id)? {
            if seed_ids.contains(&neighbor) {
                continue;
            }
            let s = score * NEIGHBOR_DECAY;
            let slot = neighbor_scores.entry(neighbor).or_insert(0.0);
            if s > *slot {
                *slot = s;
            }
        }
    }

    let neighbor_ids: Vec<&str> = neighbor_scores.keys().map(String::as_str).collect();
    let mut neighbor_rows = fetch_rows(conn, agent_id, &neighbor_ids)?;
    let mut nodes: Vec<GraphNode> = scored.into_iter().map(|(row, s)| row.into_node(s)).collect();
    let mut expanded: Vec<GraphNode> = neighbor_scores
        .into_iter()
        .filter_map(|(id, s)| neighbor_rows.remove(&id).map(|row| row.into_node(s)))
        .collect();
    expanded.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    nodes.extend(expanded);
    nodes.truncate(GRAPH_NODE_LIMIT);
    Ok(nodes)
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Wraps each whitespace-delimited word in double quotes and joins them with
/// `OR` so any matching term contributes to the BM25 rank.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "")))
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ── Internals ─────────────────────────────────────────────────────────────────

fn escape_like(term: &str) -> String {
    term.to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Items linked to `id` by an edge in either direction.
fn neighbors(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT target_id FROM context_edges WHERE source_id = ?1 \
         UNION SELECT source_id FROM context_edges WHERE target_id = ?1",
    )?;
    let ids = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Fetch rows by id, restricted to one agent.
fn fetch_rows(conn: &Connection, agent_id: &str, ids: &[&str]) -> Result<HashMap<String, ContextRow>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "SELECT {cols} FROM contexts c WHERE c.agent_id = ?1 AND c.id IN ({})",
        placeholders.join(", "),
        cols = ContextRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut bind: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
    bind.push(&agent_id);
    for id in ids {
        bind.push(id);
    }
    let rows = stmt
        .query_map(bind.as_slice(), |row| ContextRow::from_row(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|r| (r.id.clone(), r)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_memory_database, EmbeddingMeta};
    use crate::knowledge::index::{link_contexts, upsert_context, ContextRef, NewContext};
    use crate::providers::RetrievalMode;

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

    fn seed(conn: &mut Connection) {
        let items = [
            (NewContext::new(ContextKind::Function, "src/cache.rs", "fn evict_oldest() removes cache entries").with_entity("evict_oldest"), 0),
            (NewContext::new(ContextKind::Class, "src/cache.rs", "struct ContextCache holds entries").with_entity("ContextCache"), 1),
            (NewContext::new(ContextKind::Documentation, "docs/cache.md", "The cache evicts thirty percent"), 2),
        ];
        for (item, i) in items {
            upsert_context(conn, "agent", &item, &axis(i)).unwrap();
        }
    }

    fn options(max: usize) -> RetrievalOptions {
        RetrievalOptions {
            mode: RetrievalMode::Vector,
            max_results: max,
            kinds: Vec::new(),
            min_relevance: 0.0,
        }
    }

    #[test]
    fn vector_search_ranks_nearest_first() {
        let mut conn = test_db();
        seed(&mut conn);
        let results = vector_search(&conn, "agent", &axis(1), &options(3)).unwrap();
        assert_eq!(results[0].entity_name.as_deref(), Some("ContextCache"));
        assert!((results[0].relevance_score - 1.0).abs() < 1e-6);
        // Orthogonal unit vectors: distance sqrt(2), cosine 0.
        assert!(results[1].relevance_score.abs() < 1e-6);
    }

    #[test]
    fn vector_search_filters_kind_agent_and_relevance() {
        let mut conn = test_db();
        seed(&mut conn);
        let mut opts = options(5);
        opts.kinds = vec![ContextKind::Documentation];
        let docs = vector_search(&conn, "agent", &axis(0), &opts).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].kind, ContextKind::Documentation);

        opts.kinds.clear();
        opts.min_relevance = 0.5;
        assert_eq!(vector_search(&conn, "agent", &axis(0), &opts).unwrap().len(), 1);
        assert!(vector_search(&conn, "nobody", &axis(0), &opts).unwrap().is_empty());
    }

    #[test]
    fn crowded_neighbors_of_another_agent_do_not_starve_results() {
        let mut conn = test_db();
        for i in 0..40 {
            let item = NewContext::new(ContextKind::Function, "src/other.rs", format!("fn other_{i}() {{}}"))
                .with_entity(format!("other_{i}"));
            upsert_context(&mut conn, "other", &item, &axis(0)).unwrap();
        }
        let mut near = axis(0);
        near[1] = 0.1;
        let item = NewContext::new(ContextKind::Function, "src/mine.rs", "fn mine() {}").with_entity("mine");
        upsert_context(&mut conn, "agent", &item, &near).unwrap();

        let results = vector_search(&conn, "agent", &axis(0), &options(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity_name.as_deref(), Some("mine"));
        assert_eq!(vector_search(&conn, "other", &axis(0), &options(10)).unwrap().len(), 10);
    }

    #[test]
    fn kind_filter_widens_the_candidate_window() {
        let mut conn = test_db();
        for i in 0..20 {
            let item = NewContext::new(ContextKind::Function, "src/a.rs", format!("fn f{i}() {{}}"))
                .with_entity(format!("f{i}"));
            upsert_context(&mut conn, "agent", &item, &axis(0)).unwrap();
        }
        let mut far = axis(0);
        far[1] = 1.0;
        let doc = NewContext::new(ContextKind::Documentation, "docs/a.md", "about a");
        upsert_context(&mut conn, "agent", &doc, &far).unwrap();

        let mut opts = options(1);
        opts.kinds = vec![ContextKind::Documentation];
        let results = vector_search(&conn, "agent", &axis(0), &opts).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_path, "docs/a.md");
    }

    #[test]
    fn keyword_search_finds_terms_and_normalizes() {
        let mut conn = test_db();
        seed(&mut conn);
        let results = keyword_search(&conn, "agent", "cache entries", &options(5)).unwrap();
        assert!(!results.is_empty());
        assert!((results[0].relevance_score - 1.0).abs() < 1e-9);
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.relevance_score)));
        assert!(keyword_search(&conn, "agent", "\"\"", &options(5)).unwrap().is_empty());
    }

    #[test]
    fn graph_search_expands_neighbors() {
        let mut conn = test_db();
        seed(&mut conn);
        let evict = ContextRef {
            source_path: "src/cache.rs".into(),
            entity_name: Some("evict_oldest".into()),
        };
        let doc = ContextRef {
            source_path: "docs/cache.md".into(),
            entity_name: None,
        };
        link_contexts(&mut conn, "agent", &evict, "documented_by", &doc).unwrap();

        let nodes = graph_search(&conn, "agent", "what calls evict_oldest").unwrap();
        assert_eq!(nodes[0].name, "evict_oldest");
        assert_eq!(nodes[0].score, 1.0);
        let neighbor = nodes.iter().find(|n| n.source_path == "docs/cache.md").unwrap();
        assert!((neighbor.score - NEIGHBOR_DECAY).abs() < 1e-9);
        assert_eq!(neighbor.node_type, "documentation");
    }

    #[test]
    fn escape_fts_query_quotes_and_ors() {
        assert_eq!(escape_fts_query("foo bar"), "\"foo\" OR \"bar\"");
        assert_eq!(escape_fts_query("a\"b"), "\"ab\"");
        assert_eq!(escape_fts_query("   "), "");
    }
}
