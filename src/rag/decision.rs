//! Typed parsing of oracle replies.
//!
//! A reply is parsed strictly as JSON after stripping a surrounding code
//! fence. If that fails, the first balanced inline `{...}` object is tried.
//! Anything else is a [`DecisionParseError`].

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::rag::types::{Decision, DecisionKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionParseError {
    #[error("empty reply")]
    Empty,
    #[error("no JSON object in reply")]
    NoJson,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("unknown decision value '{0}'")]
    UnknownDecision(String),
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Wire shape of a decision. Accepts camelCase and snake_case field names.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    decision: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default, alias = "next_codebase_query")]
    next_codebase_query: Option<String>,
    #[serde(default, alias = "next_web_query")]
    next_web_query: Option<String>,
    #[serde(default, alias = "quality_score")]
    quality_score: Option<f64>,
    #[serde(default, alias = "confidence_score", alias = "confidence")]
    confidence_score: Option<f64>,
}

/// Parse an oracle reply into a validated [`Decision`].
pub fn parse_decision(reply: &str) -> Result<Decision, DecisionParseError> {
    let raw: RawDecision = parse_structured(reply)?;

    let decision = raw
        .decision
        .parse::<DecisionKind>()
        .map_err(DecisionParseError::UnknownDecision)?;

    Ok(Decision {
        decision,
        reasoning: raw.reasoning.trim().to_string(),
        next_codebase_query: non_blank(raw.next_codebase_query),
        next_web_query: non_blank(raw.next_web_query),
        quality_score: unit_score("qualityScore", raw.quality_score)?,
        confidence_score: unit_score("confidenceScore", raw.confidence_score)?,
    })
}

/// Strict-then-recovered JSON deserialization of an oracle reply.
pub fn parse_structured<T: DeserializeOwned>(reply: &str) -> Result<T, DecisionParseError> {
    let body = strip_code_fence(reply);
    if body.is_empty() {
        return Err(DecisionParseError::Empty);
    }

    let strict_err = match serde_json::from_str::<T>(body) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    match extract_json_object(body) {
        Some(object) => serde_json::from_str::<T>(object).map_err(|e| {
            tracing::debug!(error = %e, "inline JSON recovery failed");
            DecisionParseError::Malformed(e.to_string())
        }),
        None if body.contains('{') => Err(DecisionParseError::Malformed(strict_err.to_string())),
        None => Err(DecisionParseError::NoJson),
    }
}

/// Remove a surrounding ``` or ```json fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (e.g. `json`) on the opening line.
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// First balanced `{...}` object in `text`, string-literal aware.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn unit_score(field: &'static str, value: Option<f64>) -> Result<Option<f64>, DecisionParseError> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => Err(DecisionParseError::OutOfRange { field, value: v }),
        other => Ok(other),
    }
}
