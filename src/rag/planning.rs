//! Strategy planning, reflection, and corrective/diversifying query generation.

use std::time::Duration;

use serde::Deserialize;

use crate::providers::{ask_within, Oracle, OracleRequest};
use crate::rag::decision::parse_structured;
use crate::rag::prompt::{PlanningPrompt, ReflectionPrompt, PLANNING_SYSTEM, REFLECTION_SYSTEM};
use crate::rag::text::query_terms;
use crate::rag::types::{AgenticPlan, Decision, Reflection, RetrievedContext, Strategy};

const MAX_AUXILIARY_QUERIES: usize = 2;

const RELATION_WORDS: &[&str] = &[
    "call", "calls", "called", "caller", "callers", "depend", "depends", "dependency",
    "dependencies", "inherit", "inherits", "extends", "implements", "uses", "imports",
    "references", "relationship", "relationships",
];

/// Architectural layers searched for when results cluster on too few files:
/// (query suffix, path markers that mean the layer is already covered).
const LAYERS: &[(&str, &[&str])] = &[
    ("tests", &["test", "spec"]),
    ("configuration", &["config", "settings", ".toml", ".yaml", ".yml", ".env"]),
    ("interface definitions", &["types", "interface", "trait", "schema", ".d.ts", "model"]),
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    strategy: String,
    #[serde(default, alias = "auxiliary_queries")]
    auxiliary_queries: Vec<String>,
    #[serde(default, alias = "use_graph")]
    use_graph: Option<bool>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReflection {
    #[serde(default)]
    assessment: String,
    #[serde(default)]
    gaps: Vec<String>,
    #[serde(default, alias = "suggested_query")]
    suggested_query: Option<String>,
}

/// Ask the oracle for a retrieval plan, falling back to [`heuristic_plan`] on
/// any failure.
pub async fn plan(
    oracle: &dyn Oracle,
    query: &str,
    model: Option<&str>,
    graph_available: bool,
    deadline: Duration,
) -> AgenticPlan {
    let request = OracleRequest {
        prompt: PlanningPrompt {
            query,
            graph_available,
        }
        .render(),
        model: model.map(str::to_string),
        system_instruction: Some(PLANNING_SYSTEM.to_string()),
        json_mode: true,
    };

    let reply = match ask_within(oracle, request, deadline).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "planning call failed, using heuristic plan");
            return heuristic_plan(query, graph_available);
        }
    };

    let raw: RawPlan = match parse_structured(&reply.content) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable plan, using heuristic plan");
            return heuristic_plan(query, graph_available);
        }
    };

    let strategy = match raw.strategy.parse::<Strategy>() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "plan named an unknown strategy, using heuristic plan");
            return heuristic_plan(query, graph_available);
        }
    };

    let normalized = crate::rag::text::normalize_query(query);
    let auxiliary_queries = raw
        .auxiliary_queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && crate::rag::text::normalize_query(q) != normalized)
        .take(MAX_AUXILIARY_QUERIES)
        .collect();

    let use_graph = graph_available && raw.use_graph.unwrap_or(strategy == Strategy::Graph);
    let strategy = if strategy == Strategy::Graph && !graph_available {
        Strategy::Hybrid
    } else {
        strategy
    };

    AgenticPlan {
        strategy,
        auxiliary_queries,
        use_graph,
        reasoning: raw.reasoning,
    }
}

/// Rule-based plan: relationship questions go to the graph, exact
/// identifiers and quoted strings to keyword search, everything else hybrid.
pub fn heuristic_plan(query: &str, graph_available: bool) -> AgenticPlan {
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let relational = words.iter().any(|w| RELATION_WORDS.contains(w));
    if relational && graph_available {
        return AgenticPlan {
            strategy: Strategy::Graph,
            auxiliary_queries: Vec::new(),
            use_graph: true,
            reasoning: "query asks about relationships between code entities".into(),
        };
    }

    if is_exact_lookup(query) {
        return AgenticPlan {
            strategy: Strategy::Keyword,
            auxiliary_queries: Vec::new(),
            use_graph: false,
            reasoning: "query names an exact identifier or quoted string".into(),
        };
    }

    AgenticPlan {
        strategy: Strategy::Hybrid,
        auxiliary_queries: Vec::new(),
        use_graph: false,
        reasoning: "general question".into(),
    }
}

fn is_exact_lookup(query: &str) -> bool {
    let trimmed = query.trim();
    if trimmed.contains('"') || trimmed.contains('`') {
        return true;
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    tokens.len() == 1 || tokens.iter().any(|t| looks_like_identifier(t))
}

fn looks_like_identifier(token: &str) -> bool {
    let t = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
    if t.contains("::") || t.contains("()") {
        return true;
    }
    let inner_underscore = t.trim_matches('_').contains('_');
    let camel = t
        .chars()
        .skip(1)
        .any(|c| c.is_uppercase())
        && t.chars().any(|c| c.is_lowercase());
    inner_underscore || camel
}

/// Ask the oracle to review the current flow. Failures produce a recorded
/// reflection with an "unavailable" assessment.
pub async fn reflect(
    oracle: &dyn Oracle,
    query: &str,
    turn: usize,
    sources: &str,
    model: Option<&str>,
    deadline: Duration,
) -> Reflection {
    let request = OracleRequest {
        prompt: ReflectionPrompt {
            query,
            turn,
            sources,
        }
        .render(),
        model: model.map(str::to_string),
        system_instruction: Some(REFLECTION_SYSTEM.to_string()),
        json_mode: true,
    };

    let parsed = match ask_within(oracle, request, deadline).await {
        Ok(reply) => parse_structured::<RawReflection>(&reply.content).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match parsed {
        Ok(raw) => Reflection {
            turn,
            assessment: raw.assessment,
            gaps: raw.gaps,
            suggested_query: raw
                .suggested_query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty()),
        },
        Err(e) => {
            tracing::warn!(turn, error = %e, "reflection failed");
            Reflection {
                turn,
                assessment: format!("reflection unavailable: {e}"),
                gaps: Vec::new(),
                suggested_query: None,
            }
        }
    }
}

/// Query to run after the quality gate overrides an ANSWER.
pub fn corrective_query(
    original: &str,
    decision: &Decision,
    context: &[RetrievedContext],
    corrective_enabled: bool,
) -> String {
    let fallback = format!("{original} implementation details");
    if !corrective_enabled {
        return fallback;
    }
    if let Some(next) = &decision.next_codebase_query {
        return next.clone();
    }

    let haystack: Vec<String> = context
        .iter()
        .map(|c| format!("{} {}", c.source_path, c.content).to_lowercase())
        .collect();
    let missing: Vec<String> = query_terms(original)
        .into_iter()
        .filter(|t| !haystack.iter().any(|h| h.contains(t.as_str())))
        .collect();

    if missing.is_empty() {
        fallback
    } else {
        format!("{original} {}", missing.join(" "))
    }
}

/// Up to two queries targeting layers absent from `source_paths`.
pub fn diversification_queries<'a>(
    original: &str,
    source_paths: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let paths: Vec<String> = source_paths.into_iter().map(str::to_lowercase).collect();
    LAYERS
        .iter()
        .filter(|(_, markers)| !paths.iter().any(|p| markers.iter().any(|m| p.contains(m))))
        .take(2)
        .map(|(suffix, _)| format!("{original} {suffix}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{OracleError, OracleReply};
    use crate::rag::types::{ContextKind, DecisionKind};
    use async_trait::async_trait;

    struct Canned(Result<String, OracleError>);

    #[async_trait]
    impl Oracle for Canned {
        async fn ask(&self, _request: OracleRequest) -> Result<OracleReply, OracleError> {
            self.0.clone().map(|content| OracleReply { content })
        }
    }

    const DEADLINE: Duration = Duration::from_secs(1);

    #[test]
    fn heuristic_prefers_graph_for_relationships() {
        let plan = heuristic_plan("what calls the cache evictor", true);
        assert_eq!(plan.strategy, Strategy::Graph);
        assert!(plan.use_graph);

        let no_graph = heuristic_plan("what calls the cache evictor", false);
        assert_eq!(no_graph.strategy, Strategy::Hybrid);
        assert!(!no_graph.use_graph);
    }

    #[test]
    fn heuristic_prefers_keyword_for_identifiers() {
        assert_eq!(heuristic_plan("where is build_context_flow", false).strategy, Strategy::Keyword);
        assert_eq!(heuristic_plan("ContextCache", false).strategy, Strategy::Keyword);
        assert_eq!(heuristic_plan("find \"connection refused\"", false).strategy, Strategy::Keyword);
        assert_eq!(heuristic_plan("how does caching work", false).strategy, Strategy::Hybrid);
    }

    #[tokio::test]
    async fn oracle_plan_is_sanitized() {
        let oracle = Canned(Ok(r#"{"strategy":"graph","auxiliaryQueries":["a","Q","b","c"],"reasoning":"r"}"#.into()));
        let plan = plan(&oracle, "q", None, true, DEADLINE).await;
        assert_eq!(plan.strategy, Strategy::Graph);
        assert!(plan.use_graph);
        assert_eq!(plan.auxiliary_queries, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn plan_without_graph_downgrades() {
        let oracle = Canned(Ok(r#"{"strategy":"graph","useGraph":true}"#.into()));
        let plan = plan(&oracle, "q", None, false, DEADLINE).await;
        assert_eq!(plan.strategy, Strategy::Hybrid);
        assert!(!plan.use_graph);
    }

    #[tokio::test]
    async fn plan_falls_back_on_error() {
        let oracle = Canned(Err(OracleError::QuotaExceeded("429".into())));
        let plan = plan(&oracle, "where is ContextCache", None, false, DEADLINE).await;
        assert_eq!(plan.strategy, Strategy::Keyword);

        let garbage = Canned(Ok("no idea".into()));
        let plan = super::plan(&garbage, "how does caching work", None, false, DEADLINE).await;
        assert_eq!(plan.strategy, Strategy::Hybrid);
    }

    #[tokio::test]
    async fn reflection_failure_is_recorded() {
        let oracle = Canned(Err(OracleError::Request("connection reset".into())));
        let r = reflect(&oracle, "q", 2, "", None, DEADLINE).await;
        assert_eq!(r.turn, 2);
        assert!(r.assessment.starts_with("reflection unavailable"));
        assert!(r.suggested_query.is_none());
    }

    #[tokio::test]
    async fn reflection_parses_suggestion() {
        let oracle = Canned(Ok(r#"{"assessment":"thin","gaps":["callers"],"suggestedQuery":"who calls evict"}"#.into()));
        let r = reflect(&oracle, "q", 2, "", None, DEADLINE).await;
        assert_eq!(r.gaps, vec!["callers"]);
        assert_eq!(r.suggested_query.as_deref(), Some("who calls evict"));
    }

    fn decision(next: Option<&str>) -> Decision {
        Decision {
            decision: DecisionKind::Answer,
            reasoning: String::new(),
            next_codebase_query: next.map(str::to_string),
            next_web_query: None,
            quality_score: None,
            confidence_score: None,
        }
    }

    #[test]
    fn corrective_query_priorities() {
        let ctx = vec![RetrievedContext::new(ContextKind::File, "src/cache.rs", "cache code")];

        assert_eq!(
            corrective_query("cache eviction", &decision(Some("evict callers")), &ctx, true),
            "evict callers"
        );
        assert_eq!(
            corrective_query("cache eviction", &decision(None), &ctx, true),
            "cache eviction eviction"
        );
        assert_eq!(
            corrective_query("cache", &decision(None), &ctx, true),
            "cache implementation details"
        );
        assert_eq!(
            corrective_query("cache eviction", &decision(Some("x")), &ctx, false),
            "cache eviction implementation details"
        );
    }

    #[test]
    fn diversification_targets_missing_layers() {
        let qs = diversification_queries("cache", ["src/cache.rs", "src/cache_test.rs"]);
        assert_eq!(qs, vec!["cache configuration", "cache interface definitions"]);

        let covered = diversification_queries(
            "cache",
            ["tests/cache.rs", "config.toml", "src/types.rs"],
        );
        assert!(covered.is_empty());
    }
}
