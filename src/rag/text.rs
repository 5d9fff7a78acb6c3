//! Small text helpers shared across the search loop.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "by", "can", "code",
    "could", "describe", "do", "does", "explain", "find", "for", "from", "get", "has", "have",
    "how", "i", "in", "into", "is", "it", "its", "me", "of", "on", "or", "our", "show", "should",
    "so", "that", "the", "their", "then", "there", "these", "this", "to", "used", "using", "was",
    "we", "what", "when", "where", "which", "who", "why", "will", "with", "work", "works", "would",
    "you",
];

/// Normalized form used to detect repeated queries: trimmed, lowercased,
/// inner whitespace collapsed.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract search terms from a natural-language query.
///
/// Splits on anything that is not alphanumeric or `_`, drops stopwords and
/// tokens shorter than 3 characters, and keeps first-seen order. Returns an
/// empty list when nothing survives; callers fall back to [`naive_terms`].
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Whitespace tokenization with punctuation trimmed.
pub fn naive_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Keyword extraction with the naive fallback applied.
pub fn query_terms(query: &str) -> Vec<String> {
    let terms = extract_keywords(query);
    if terms.is_empty() {
        naive_terms(query)
    } else {
        terms
    }
}

/// Truncate content to max_chars, appending "..." if truncated.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((end, _)) => format!("{}...", &content[..end]),
    }
}
