//! Citation generation and answer-reference validation.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::rag::text::truncate_preview;
use crate::rag::types::{Citation, RetrievedContext};

// Literal pattern; compiling it cannot fail.
static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("citation pattern compiles"));

const EXCERPT_CHARS: usize = 150;

/// Outcome of validating the `[n]` references in a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationValidation {
    /// Every reference occurrence, in order.
    pub references: Vec<usize>,
    /// Distinct ids in `[1, N]`.
    pub valid_ids: Vec<usize>,
    /// Distinct ids outside `[1, N]`.
    pub invalid_ids: Vec<usize>,
    pub accuracy: f64,
    pub coverage: f64,
    pub quality: f64,
}

/// Append-only citation registry for one run.
#[derive(Debug, Default)]
pub struct CitationTracker {
    citations: Vec<Citation>,
    by_key: HashMap<String, usize>,
}

impl CitationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accumulated item. Returns its id; an item already
    /// registered keeps the id it was first given.
    pub fn ingest(&mut self, item: &RetrievedContext) -> usize {
        let key = item.dedup_key();
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }

        let id = self.citations.len() + 1;
        let title = match &item.entity_name {
            Some(name) if !name.is_empty() => format!("{name} ({})", item.source_path),
            _ => item.source_path.clone(),
        };
        self.citations.push(Citation {
            id,
            source: item.source_path.clone(),
            source_type: item.kind,
            title,
            line_range: item.line_range(),
            confidence: item.relevance_score.clamp(0.0, 1.0),
            relevance_score: item.relevance_score,
            extracted_text: truncate_preview(item.content.trim(), EXCERPT_CHARS),
        });
        self.by_key.insert(key, id);
        id
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn len(&self) -> usize {
        self.citations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    /// Citation id for an item's dedup key.
    pub fn id_for(&self, key: &str) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    pub fn validate(&self, text: &str) -> CitationValidation {
        validate_references(text, self.citations.len())
    }
}

/// All `[n]` reference occurrences in `text`, in order.
pub fn extract_references(text: &str) -> Vec<usize> {
    REFERENCE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1)?.as_str().parse().ok())
        .collect()
}

/// Whether `text` contains at least one `[n]` marker.
pub fn has_references(text: &str) -> bool {
    REFERENCE.is_match(text)
}

/// Score the references in `text` against `total` generated citations.
pub fn validate_references(text: &str, total: usize) -> CitationValidation {
    let references = extract_references(text);

    let mut valid = BTreeSet::new();
    let mut invalid = BTreeSet::new();
    for &id in &references {
        if (1..=total).contains(&id) {
            valid.insert(id);
        } else {
            invalid.insert(id);
        }
    }

    if !invalid.is_empty() {
        tracing::warn!(invalid = ?invalid, total, "answer cites unknown sources");
    }

    let accuracy = if references.is_empty() {
        if total == 0 { 1.0 } else { 0.0 }
    } else {
        valid.len() as f64 / references.len() as f64
    };

    let coverage = match (total, references.is_empty()) {
        (0, true) => 1.0,
        (0, false) => 0.0,
        _ => valid.len() as f64 / total as f64,
    };

    CitationValidation {
        references,
        valid_ids: valid.into_iter().collect(),
        invalid_ids: invalid.into_iter().collect(),
        accuracy,
        coverage,
        quality: 0.6 * accuracy + 0.4 * coverage,
    }
}
