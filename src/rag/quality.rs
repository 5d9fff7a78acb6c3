//! Heuristic quality scoring and the ANSWER override gate.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::QualityConfig;
use crate::rag::citations::{has_references, validate_references};
use crate::rag::text::query_terms;
use crate::rag::types::{Decision, RetrievedContext};

const DEFINITION_MARKERS: &[&str] = &[
    "fn ", "def ", "class ", "struct ", "enum ", "trait ", "impl ", "interface ", "function ",
    "type ", "import ", "use ", "#include", "require(", "export ",
];

const LONG_CONTENT_CHARS: usize = 200;
const COUNT_BONUS_PER_ITEM: f64 = 0.025;
const COUNT_BONUS_CAP: f64 = 0.2;
/// Number of kinds at which type diversity saturates.
const DIVERSITY_SATURATION: usize = 4;

/// Breakdown of the heuristic quality score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAssessment {
    pub score: f64,
    pub mean_relevance: f64,
    pub term_coverage: f64,
    pub structural: f64,
    pub type_diversity: f64,
    pub count_bonus: f64,
}

/// Score how well `context` supports answering `query`.
pub fn estimate_quality(query: &str, context: &[RetrievedContext]) -> QualityAssessment {
    if context.is_empty() {
        return QualityAssessment::default();
    }
    let n = context.len() as f64;

    let mean_relevance = context
        .iter()
        .map(|c| c.relevance_score.clamp(0.0, 1.0))
        .sum::<f64>()
        / n;

    let haystack: Vec<String> = context
        .iter()
        .map(|c| format!("{} {}", c.source_path, c.content).to_lowercase())
        .collect();
    let terms = query_terms(query);
    let term_coverage = if terms.is_empty() {
        1.0
    } else {
        let found = terms
            .iter()
            .filter(|t| haystack.iter().any(|h| h.contains(t.as_str())))
            .count();
        found as f64 / terms.len() as f64
    };

    let structural = context.iter().map(structural_signal).sum::<f64>() / n;

    let kinds: HashSet<_> = context.iter().map(|c| c.kind).collect();
    let type_diversity =
        (kinds.len() as f64 / context.len().min(DIVERSITY_SATURATION) as f64).min(1.0);

    let count_bonus = (COUNT_BONUS_PER_ITEM * n).min(COUNT_BONUS_CAP);

    let score = (0.4 * mean_relevance + 0.3 * term_coverage + 0.2 * structural + 0.1 * type_diversity
        + count_bonus)
        .clamp(0.0, 1.0);

    QualityAssessment {
        score,
        mean_relevance,
        term_coverage,
        structural,
        type_diversity,
        count_bonus,
    }
}

/// Fraction of the three structural indicators present in one item.
fn structural_signal(item: &RetrievedContext) -> f64 {
    let long = item.content.chars().count() > LONG_CONTENT_CHARS;
    let definition = DEFINITION_MARKERS.iter().any(|m| item.content.contains(m));
    let named = item.entity_name.as_deref().is_some_and(|n| !n.is_empty());
    [long, definition, named].iter().filter(|&&b| b).count() as f64 / 3.0
}

/// Why the gate refused an ANSWER.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OverrideReason {
    LowQuality { score: f64, threshold: f64 },
    LowConfidence { items: usize, confidence: f64 },
    WeakCitations { quality: f64, threshold: f64 },
}

impl std::fmt::Display for OverrideReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowQuality { score, threshold } => {
                write!(f, "quality {score:.2} below {threshold:.2}")
            }
            Self::LowConfidence { items, confidence } => {
                write!(f, "only {items} items with confidence {confidence:.2}")
            }
            Self::WeakCitations { quality, threshold } => {
                write!(f, "citation quality {quality:.2} below {threshold:.2}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Accept(QualityAssessment),
    Override {
        assessment: QualityAssessment,
        reasons: Vec<OverrideReason>,
    },
}

impl GateVerdict {
    pub fn assessment(&self) -> &QualityAssessment {
        match self {
            Self::Accept(a) => a,
            Self::Override { assessment, .. } => assessment,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
    citation_threshold: f64,
}

impl QualityGate {
    pub fn new(config: QualityConfig, citation_threshold: f64) -> Self {
        Self {
            config,
            citation_threshold,
        }
    }

    /// Judge an ANSWER decision against the accumulated context.
    ///
    /// `citation_count` is the number of citations generated so far. On the
    /// final iteration the verdict is always `Accept`.
    pub fn evaluate(
        &self,
        query: &str,
        decision: &Decision,
        context: &[RetrievedContext],
        citation_count: usize,
        final_iteration: bool,
    ) -> GateVerdict {
        let assessment = estimate_quality(query, context);
        if final_iteration {
            return GateVerdict::Accept(assessment);
        }

        let mut reasons = Vec::new();

        if assessment.score < self.config.min_quality {
            reasons.push(OverrideReason::LowQuality {
                score: assessment.score,
                threshold: self.config.min_quality,
            });
        }

        let confidence = decision.confidence_score.unwrap_or(assessment.score);
        if context.len() < self.config.min_context_items && confidence < self.config.min_confidence {
            reasons.push(OverrideReason::LowConfidence {
                items: context.len(),
                confidence,
            });
        }

        if has_references(&decision.reasoning) {
            let speculative = validate_references(&decision.reasoning, citation_count);
            if speculative.quality < self.citation_threshold {
                reasons.push(OverrideReason::WeakCitations {
                    quality: speculative.quality,
                    threshold: self.citation_threshold,
                });
            }
        }

        if reasons.is_empty() {
            GateVerdict::Accept(assessment)
        } else {
            GateVerdict::Override {
                assessment,
                reasons,
            }
        }
    }
}
