//! Prompt builders for every oracle call the search loop makes.
//!
//! Each builder is a plain struct of named fields; `render()` produces the
//! user prompt. System instructions are the `*_SYSTEM` constants.

use std::fmt::Write as _;

use crate::rag::citations::CitationTracker;
use crate::rag::types::{RetrievedContext, WebSource};

pub const DECISION_SYSTEM: &str = "You are the control loop of a code-search assistant. \
You judge whether the gathered context is enough to answer the user's question. \
Reply with a single JSON object and nothing else.";

pub const ANSWER_SYSTEM: &str = "You answer questions about a codebase using only the numbered \
sources provided. Cite sources inline as [n]. If the sources do not contain the answer, say so.";

pub const PLANNING_SYSTEM: &str = "You plan retrieval for a code-search assistant. \
Reply with a single JSON object and nothing else.";

pub const REFLECTION_SYSTEM: &str = "You review the context gathered so far for a code question \
and point out what is missing. Reply with a single JSON object and nothing else.";

/// Characters of each item shown to the oracle.
const ITEM_PREVIEW_CHARS: usize = 1200;

/// Render the flow as numbered sources, numbered by citation id where one exists.
pub fn render_sources(flow: &[RetrievedContext], citations: &CitationTracker) -> String {
    if flow.is_empty() {
        return "(no context retrieved)\n".to_string();
    }

    let mut out = String::new();
    for (pos, item) in flow.iter().enumerate() {
        let id = citations.id_for(&item.dedup_key()).unwrap_or(pos + 1);
        let _ = write!(out, "[{id}] {} ({}", item.source_path, item.kind);
        if let Some(name) = item.entity_name.as_deref().filter(|n| !n.is_empty()) {
            let _ = write!(out, ", {name}");
        }
        if let Some(range) = item.line_range() {
            let _ = write!(out, ", lines {}-{}", range.start, range.end);
        }
        if let Some(chunk) = item.chunk() {
            let _ = write!(out, ", part {}/{}", chunk.index + 1, chunk.total);
        }
        let _ = writeln!(out, ", relevance {:.2})", item.relevance_score);
        let _ = writeln!(
            out,
            "{}\n",
            crate::rag::text::truncate_preview(item.content.trim(), ITEM_PREVIEW_CHARS)
        );
    }
    out
}

/// Per-turn decision prompt.
pub struct DecisionPrompt<'a> {
    pub query: &'a str,
    pub turn: usize,
    pub max_iterations: usize,
    pub sources: &'a str,
    pub issued_queries: &'a [String],
    pub web_enabled: bool,
    pub reflection_note: Option<&'a str>,
}

impl DecisionPrompt<'_> {
    pub fn render(&self) -> String {
        let issued = if self.issued_queries.is_empty() {
            "(none)".to_string()
        } else {
            self.issued_queries.join("; ")
        };
        let web_line = if self.web_enabled {
            "- SEARCH_WEB: the answer needs external documentation; give nextWebQuery."
        } else {
            "- SEARCH_WEB is unavailable in this session."
        };
        let reflection = self
            .reflection_note
            .map(|note| format!("\nReviewer notes:\n{note}\n"))
            .unwrap_or_default();

        format!(
            "Question: {query}\n\
             Turn {turn} of {max}.\n\
             Queries already issued: {issued}\n\
             {reflection}\n\
             Sources:\n{sources}\n\
             Choose one action:\n\
             - ANSWER: the sources are sufficient.\n\
             - SEARCH_AGAIN: give a new, different nextCodebaseQuery.\n\
             {web_line}\n\n\
             Respond with JSON:\n\
             {{\"decision\": \"ANSWER|SEARCH_AGAIN|SEARCH_WEB\", \"reasoning\": \"...\", \
             \"nextCodebaseQuery\": \"...\", \"nextWebQuery\": \"...\", \
             \"qualityScore\": 0.0-1.0, \"confidenceScore\": 0.0-1.0}}",
            query = self.query,
            turn = self.turn,
            max = self.max_iterations,
            sources = self.sources,
        )
    }
}

/// Why the final answer is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    /// The oracle chose ANSWER and the gate passed.
    Accepted,
    /// The loop ended without an accepted ANSWER; answer from what exists.
    Forced,
    /// Nothing was retrieved.
    EmptyContext,
    /// Nothing was retrieved from the codebase; web results are the only sources.
    WebFallback,
}

pub struct AnswerPrompt<'a> {
    pub query: &'a str,
    pub mode: AnswerMode,
    pub sources: &'a str,
    pub web_sources: &'a [WebSource],
}

impl AnswerPrompt<'_> {
    pub fn render(&self) -> String {
        match self.mode {
            AnswerMode::Accepted => format!(
                "Question: {}\n\nSources:\n{}\n\
                 Write a complete answer. Cite every claim with [n] using the source numbers above.",
                self.query, self.sources
            ),
            AnswerMode::Forced => format!(
                "Question: {}\n\nSources:\n{}\n\
                 The search budget is exhausted. Answer as well as these sources allow, cite them \
                 with [n], and state clearly what could not be determined.",
                self.query, self.sources
            ),
            AnswerMode::EmptyContext => format!(
                "Question: {}\n\n\
                 No relevant code or documentation was found in the indexed knowledge base. \
                 Explain that the answer could not be grounded in the codebase, suggest what the \
                 user could index or search for, and do not invent file names.",
                self.query
            ),
            AnswerMode::WebFallback => {
                let mut web = String::new();
                for (i, source) in self.web_sources.iter().enumerate() {
                    let _ = writeln!(
                        web,
                        "[{}] {} <{}>\n{}\n",
                        i + 1,
                        source.title,
                        source.url,
                        crate::rag::text::truncate_preview(&source.content, ITEM_PREVIEW_CHARS)
                    );
                }
                format!(
                    "Question: {}\n\n\
                     Nothing relevant was found in the codebase. Web results:\n{}\n\
                     Answer from these results, cite them with [n], and note that they are external.",
                    self.query, web
                )
            }
        }
    }
}

/// Agentic planning prompt.
pub struct PlanningPrompt<'a> {
    pub query: &'a str,
    pub graph_available: bool,
}

impl PlanningPrompt<'_> {
    pub fn render(&self) -> String {
        let graph = if self.graph_available {
            "A knowledge graph of code entities and their relations is available."
        } else {
            "No knowledge graph is available; set useGraph to false."
        };
        format!(
            "Question: {}\n{graph}\n\n\
             Pick a retrieval strategy:\n\
             - vector: conceptual questions\n\
             - keyword: exact identifiers, error strings, file names\n\
             - hybrid: mixed questions\n\
             - graph: relationships such as callers, dependencies, inheritance\n\
             Suggest at most 2 auxiliary queries that cover other angles.\n\n\
             Respond with JSON:\n\
             {{\"strategy\": \"vector|keyword|hybrid|graph\", \"auxiliaryQueries\": [\"...\"], \
             \"useGraph\": true|false, \"reasoning\": \"...\"}}",
            self.query
        )
    }
}

/// Mid-run reflection prompt.
pub struct ReflectionPrompt<'a> {
    pub query: &'a str,
    pub turn: usize,
    pub sources: &'a str,
}

impl ReflectionPrompt<'_> {
    pub fn render(&self) -> String {
        format!(
            "Question: {}\nAfter turn {} the following context has been gathered:\n\n{}\n\
             Assess whether it covers the question and list the gaps.\n\n\
             Respond with JSON:\n\
             {{\"assessment\": \"...\", \"gaps\": [\"...\"], \"suggestedQuery\": \"...\"}}",
            self.query, self.turn, self.sources
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::ContextKind;

    #[test]
    fn sources_use_citation_ids() {
        let mut tracker = CitationTracker::new();
        let a = RetrievedContext::new(ContextKind::Function, "src/a.rs", "fn a() {}")
            .with_entity("a")
            .with_relevance(0.9);
        let b = RetrievedContext::new(ContextKind::File, "src/b.rs", "mod b;");
        tracker.ingest(&a);
        tracker.ingest(&b);

        // Flow order differs from ingestion order; ids must not.
        let rendered = render_sources(&[b.clone(), a.clone()], &tracker);
        let b_pos = rendered.find("[2] src/b.rs").unwrap();
        let a_pos = rendered.find("[1] src/a.rs (function, a").unwrap();
        assert!(b_pos < a_pos);
    }

    #[test]
    fn decision_prompt_mentions_web_only_when_enabled() {
        let issued = vec!["first".to_string()];
        let mut prompt = DecisionPrompt {
            query: "q",
            turn: 1,
            max_iterations: 5,
            sources: "(no context retrieved)\n",
            issued_queries: &issued,
            web_enabled: false,
            reflection_note: None,
        };
        assert!(prompt.render().contains("SEARCH_WEB is unavailable"));
        prompt.web_enabled = true;
        assert!(prompt.render().contains("give nextWebQuery"));
        assert!(prompt.render().contains("Turn 1 of 5"));
    }

    #[test]
    fn web_fallback_lists_results() {
        let web = vec![WebSource {
            title: "Tokio docs".into(),
            url: "https://tokio.rs".into(),
            content: "join! polls futures concurrently".into(),
        }];
        let text = AnswerPrompt {
            query: "what does join do",
            mode: AnswerMode::WebFallback,
            sources: "",
            web_sources: &web,
        }
        .render();
        assert!(text.contains("[1] Tokio docs <https://tokio.rs>"));
    }
}
