//! Context flow builder: turns the accumulated evidence into a bounded,
//! ordered sequence for prompting.
//!
//! chunk oversized items → split recent/older → sort each by relevance and
//! type priority → cap older → concat and dedup → cap total.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::config::FlowConfig;
use crate::rag::types::{ChunkInfo, RetrievedContext};

/// Build the prompt flow.
///
/// `recent_keys` holds the dedup keys added this turn. `chunk_size` is `None`
/// when long-context chunking is disabled.
pub fn build_context_flow(
    accumulated: &[RetrievedContext],
    recent_keys: &HashSet<String>,
    chunk_size: Option<usize>,
    config: &FlowConfig,
) -> Vec<RetrievedContext> {
    let expanded: Vec<RetrievedContext> = match chunk_size {
        Some(size) => accumulated
            .iter()
            .flat_map(|item| chunk_context(item, size))
            .collect(),
        None => accumulated.to_vec(),
    };

    let (mut recent, mut older): (Vec<_>, Vec<_>) = expanded
        .into_iter()
        .partition(|item| recent_keys.contains(&item.dedup_key()));

    recent.sort_by(compare_priority);
    older.sort_by(compare_priority);

    if older.len() > config.older_cap_trigger {
        older.retain(|item| item.relevance_score >= config.older_min_relevance);
        older.truncate(config.older_keep);
    }

    let mut seen = HashSet::new();
    recent
        .into_iter()
        .chain(older)
        .filter(|item| seen.insert(flow_key(item)))
        .take(config.max_items)
        .collect()
}

/// Relevance descending, then type priority, then item identity, then chunk
/// order. Chunks of one item stay adjacent.
pub fn compare_priority(a: &RetrievedContext, b: &RetrievedContext) -> Ordering {
    b.relevance_score
        .partial_cmp(&a.relevance_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.kind.priority().cmp(&b.kind.priority()))
        .then_with(|| a.dedup_key().cmp(&b.dedup_key()))
        .then_with(|| {
            let ai = a.chunk().map(|c| c.index).unwrap_or(0);
            let bi = b.chunk().map(|c| c.index).unwrap_or(0);
            ai.cmp(&bi)
        })
}

fn flow_key(item: &RetrievedContext) -> (String, usize) {
    (item.dedup_key(), item.chunk().map(|c| c.index).unwrap_or(0))
}

/// Split one item into chunk items when its content exceeds `chunk_size` characters.
pub fn chunk_context(item: &RetrievedContext, chunk_size: usize) -> Vec<RetrievedContext> {
    let pieces = chunk_text(&item.content, chunk_size);
    if pieces.len() <= 1 {
        return vec![item.clone()];
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, content)| {
            let mut chunk = item.clone();
            chunk.content = content;
            chunk.metadata_mut().chunk = Some(ChunkInfo { index, total });
            chunk
        })
        .collect()
}

/// Split text into pieces of at most `chunk_size` characters, preferring to
/// break after the nearest sentence end or newline that lies past half of the
/// budget.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if chunk_size == 0 || text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > chunk_size {
        let window_end = byte_offset(rest, chunk_size);
        let min_break = byte_offset(rest, chunk_size / 2);
        let cut = find_break(&rest[..window_end], min_break).unwrap_or(window_end);

        let piece = rest[..cut].trim_end();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Byte offset of the `n`th char (or the end of the string).
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Cut position just after the last boundary in `window` that lies past `min_break`.
fn find_break(window: &str, min_break: usize) -> Option<usize> {
    let mut chars = window.char_indices().rev().peekable();
    let mut next: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if i < min_break {
            break;
        }
        let at_boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => next.map_or(false, char::is_whitespace),
            _ => false,
        };
        if at_boundary {
            return Some(i + c.len_utf8());
        }
        next = Some(c);
    }
    None
}
