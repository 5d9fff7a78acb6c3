//! The iterative search loop.
//!
//! One call to [`Orchestrator::perform_iterative_search`] owns all of its
//! state: queue, accumulated context, citations, cache and metrics. Each
//! turn retrieves a batch of queries, merges the results, asks the oracle for
//! a [`Decision`], and either loops or concludes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;

use crate::config::{CacheConfig, FlowConfig, QualityConfig, QuarryConfig};
use crate::providers::{
    ask_within, ContextRetriever, GraphQuery, Oracle, OracleError, OracleRequest, RetrievalMode,
    RetrievalOptions, WebResult, WebSearch, WebSearchOptions,
};
use crate::rag::cache::{self, ContextCache};
use crate::rag::citations::CitationTracker;
use crate::rag::decision::parse_decision;
use crate::rag::flow::build_context_flow;
use crate::rag::hybrid::{ChannelWeights, HybridSearchCoordinator};
use crate::rag::planning;
use crate::rag::prompt::{
    render_sources, AnswerMode, AnswerPrompt, DecisionPrompt, ANSWER_SYSTEM, DECISION_SYSTEM,
};
use crate::rag::quality::{GateVerdict, QualityGate};
use crate::rag::text::{normalize_query, truncate_preview};
use crate::rag::types::{
    AgenticPlan, ContextKind, Decision, DecisionKind, DecisionRecord, IterativeRagResult,
    IterativeSearchArgs, Reflection, RetrievedContext, SearchChannel, SearchMetrics, Strategy,
    TurnLog, WebSource,
};

/// Relevance assigned to web results that carry no score.
const DEFAULT_WEB_RELEVANCE: f64 = 0.6;

// ── Settings ──────────────────────────────────────────────────────────────────

/// Loop bounds and tuning, resolved once from [`QuarryConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations_cap: usize,
    pub max_queries_per_turn: usize,
    pub stall_limit: usize,
    pub diversity_cap: usize,
    pub diversity_threshold: f64,
    pub max_accumulated_context: usize,
    pub call_timeout: Duration,
    pub default_max_results: usize,
    pub rrf_k: usize,
    pub weights: ChannelWeights,
    pub always_query_graph: bool,
    pub web_max_results: usize,
    pub cache: CacheConfig,
    pub flow: FlowConfig,
    pub quality: QualityConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &QuarryConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            max_iterations_cap: o.max_iterations_cap.max(1),
            max_queries_per_turn: o.max_queries_per_turn.max(1),
            stall_limit: o.stall_limit.max(1),
            diversity_cap: o.diversity_cap.max(1),
            diversity_threshold: o.diversity_threshold,
            max_accumulated_context: o.max_accumulated_context.max(1),
            call_timeout: o.call_timeout(),
            default_max_results: config.retrieval.default_max_results.max(1),
            rrf_k: config.retrieval.rrf_k,
            weights: ChannelWeights::from_config(&config.retrieval),
            always_query_graph: config.retrieval.always_query_graph,
            web_max_results: config.web_search.max_results.max(1),
            cache: config.cache.clone(),
            flow: config.flow.clone(),
            quality: config.quality.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&QuarryConfig::default())
    }
}

// ── Termination ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Termination {
    Accepted,
    ContextStable,
    RepeatedQueries,
    NoNextAction,
    MaxIterations,
    ParseFailure(String),
    OracleNotInitialized(String),
    OracleQuota(String),
    OracleFailure(String),
}

impl Termination {
    fn from_oracle_error(err: OracleError) -> Self {
        match err {
            OracleError::NotInitialized(msg) => Self::OracleNotInitialized(msg),
            OracleError::QuotaExceeded(msg) => Self::OracleQuota(msg),
            other => Self::OracleFailure(other.to_string()),
        }
    }

    fn reason(&self, stall_limit: usize) -> String {
        match self {
            Self::Accepted => "ANSWER decision reached with quality gates passed".into(),
            Self::ContextStable => {
                format!("context stable: no new context for {stall_limit} consecutive turns")
            }
            Self::RepeatedQueries => "safety: repeated/empty queries".into(),
            Self::NoNextAction => "no valid next action".into(),
            Self::MaxIterations => {
                "max iterations reached; answer forced from accumulated context".into()
            }
            Self::ParseFailure(msg) => format!("parsing failure: {msg}"),
            Self::OracleNotInitialized(msg) => format!("oracle not initialized: {msg}"),
            Self::OracleQuota(msg) => format!("oracle quota exceeded: {msg}"),
            Self::OracleFailure(msg) => format!("oracle error: {msg}"),
        }
    }

    fn oracle_failed(&self) -> bool {
        matches!(
            self,
            Self::OracleNotInitialized(_) | Self::OracleQuota(_) | Self::OracleFailure(_)
        )
    }
}

// ── Run state ─────────────────────────────────────────────────────────────────

/// Mutable state of one search invocation.
struct SearchRun {
    query: String,
    agent_id: String,
    model: Option<String>,
    max_iterations: usize,
    options: RetrievalOptions,
    strategy: Strategy,
    use_graph: bool,
    web_enabled: bool,
    chunk_size: Option<usize>,

    queue: VecDeque<String>,
    issued: HashSet<String>,
    issued_order: Vec<String>,
    accumulated: Vec<RetrievedContext>,
    seen: HashSet<String>,
    source_frequency: HashMap<String, usize>,
    recent_keys: HashSet<String>,
    /// Keys added by web search, still new to the next turn's decision.
    carried_keys: Vec<String>,
    citations: CitationTracker,
    cache: Mutex<ContextCache>,

    web_sources: Vec<WebSource>,
    decision_log: Vec<DecisionRecord>,
    reflections: Vec<Reflection>,
    plan: Option<AgenticPlan>,
    metrics: SearchMetrics,

    repeat_count: usize,
    stall_count: usize,
    diversified: bool,
}

impl SearchRun {
    /// Append items not yet seen, up to the accumulation cap. Returns how many were added.
    fn merge(&mut self, items: Vec<RetrievedContext>, max_accumulated: usize) -> usize {
        let mut added = 0;
        for item in items {
            if self.accumulated.len() >= max_accumulated {
                tracing::debug!(cap = max_accumulated, "accumulated context full");
                break;
            }
            let key = item.dedup_key();
            if !self.seen.insert(key.clone()) {
                continue;
            }
            self.citations.ingest(&item);
            *self
                .source_frequency
                .entry(item.source_path.clone())
                .or_insert(0) += 1;
            self.recent_keys.insert(key);
            self.accumulated.push(item);
            added += 1;
        }
        self.metrics.context_items_added += added;
        added
    }

    /// Unique source paths over `min(total items, cap)`.
    fn diversity(&self, cap: usize) -> f64 {
        if self.accumulated.is_empty() {
            return 0.0;
        }
        let denominator = self.accumulated.len().min(cap);
        (self.source_frequency.len() as f64 / denominator as f64).min(1.0)
    }

    /// Pop up to `limit` queries, dropping blank and already-issued ones.
    /// The flag reports whether anything was dropped.
    fn next_batch(&mut self, limit: usize) -> (Vec<String>, bool) {
        let mut batch = Vec::new();
        let mut skipped = false;
        while batch.len() < limit {
            let Some(candidate) = self.queue.pop_front() else {
                break;
            };
            let normalized = normalize_query(&candidate);
            if normalized.is_empty() || !self.issued.insert(normalized) {
                tracing::debug!(query = %candidate, "skipping repeated or blank query");
                skipped = true;
                continue;
            }
            let trimmed = candidate.trim().to_string();
            self.issued_order.push(trimmed.clone());
            batch.push(trimmed);
        }
        (batch, skipped)
    }

    fn flow(&self, flow_config: &FlowConfig) -> Vec<RetrievedContext> {
        build_context_flow(&self.accumulated, &self.recent_keys, self.chunk_size, flow_config)
    }

    fn record_decision(&mut self, turn: usize, decision: &Decision, next_query: Option<String>, overridden: bool) {
        self.decision_log.push(DecisionRecord {
            turn,
            decision: decision.decision,
            reasoning: decision.reasoning.clone(),
            next_query,
            overridden,
        });
    }

    fn log_turn(
        &mut self,
        turn: usize,
        queries: Vec<String>,
        decision: Option<DecisionKind>,
        quality: Option<f64>,
        new_context_count: usize,
    ) {
        self.metrics.turns.push(TurnLog {
            turn,
            queries,
            strategy: self.strategy,
            decision,
            quality,
            new_context_count,
        });
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator {
    retriever: Arc<dyn ContextRetriever>,
    graph: Option<Arc<dyn GraphQuery>>,
    oracle: Arc<dyn Oracle>,
    web: Option<Arc<dyn WebSearch>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<dyn ContextRetriever>,
        oracle: Arc<dyn Oracle>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            retriever,
            graph: None,
            oracle,
            web: None,
            settings,
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphQuery>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_web_search(mut self, web: Arc<dyn WebSearch>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run the iterative search loop to completion.
    ///
    /// Never fails: oracle, retrieval, and parsing problems end the run with
    /// a termination reason and a best-effort answer.
    pub async fn perform_iterative_search(&self, args: IterativeSearchArgs) -> IterativeRagResult {
        let mut run = self.start_run(&args);
        tracing::info!(
            agent = %run.agent_id,
            query = %run.query,
            max_iterations = run.max_iterations,
            "iterative search started"
        );

        let termination = if normalize_query(&args.query).is_empty() {
            Termination::RepeatedQueries
        } else {
            self.plan_run(&mut run, &args).await;
            self.iterate(&mut run, &args).await
        };

        self.conclude(run, termination).await
    }

    fn start_run(&self, args: &IterativeSearchArgs) -> SearchRun {
        let max_iterations = args.max_iterations.clamp(1, self.settings.max_iterations_cap);
        let ctx = &args.context_options;
        let options = RetrievalOptions {
            mode: RetrievalMode::Vector,
            max_results: ctx.max_results.unwrap_or(self.settings.default_max_results).max(1),
            kinds: ctx.kinds.clone().unwrap_or_default(),
            min_relevance: ctx.min_relevance.unwrap_or(0.0).clamp(0.0, 1.0),
        };
        let strategy = if args.features.hybrid_search {
            Strategy::Hybrid
        } else {
            Strategy::Vector
        };
        let chunk_size = (args.features.long_context_chunking && args.chunk_size > 0)
            .then_some(args.chunk_size);

        SearchRun {
            query: args.query.trim().to_string(),
            agent_id: args.agent_id.clone(),
            model: args.model.clone(),
            max_iterations,
            options,
            strategy,
            use_graph: false,
            web_enabled: args.features.web_search && self.web.is_some(),
            chunk_size,
            queue: VecDeque::from([args.query.clone()]),
            issued: HashSet::new(),
            issued_order: Vec::new(),
            accumulated: Vec::new(),
            seen: HashSet::new(),
            source_frequency: HashMap::new(),
            recent_keys: HashSet::new(),
            carried_keys: Vec::new(),
            citations: CitationTracker::new(),
            cache: Mutex::new(ContextCache::new(&self.settings.cache)),
            web_sources: Vec::new(),
            decision_log: Vec::new(),
            reflections: Vec::new(),
            plan: None,
            metrics: SearchMetrics::default(),
            repeat_count: 0,
            stall_count: 0,
            diversified: false,
        }
    }

    /// Pick the strategy and seed auxiliary queries.
    async fn plan_run(&self, run: &mut SearchRun, args: &IterativeSearchArgs) {
        let graph_available = self.graph.is_some();

        if args.features.agentic_planning {
            let plan = planning::plan(
                self.oracle.as_ref(),
                &run.query,
                run.model.as_deref(),
                graph_available,
                self.settings.call_timeout,
            )
            .await;
            tracing::info!(strategy = %plan.strategy, use_graph = plan.use_graph, "retrieval plan");

            run.strategy = match plan.strategy {
                Strategy::Hybrid if !args.features.hybrid_search => Strategy::Vector,
                other => other,
            };
            run.use_graph = plan.use_graph;
            run.queue.extend(plan.auxiliary_queries.iter().cloned());
            run.plan = Some(plan);
        }

        run.use_graph = graph_available
            && (run.use_graph || run.strategy == Strategy::Graph || self.settings.always_query_graph);
    }

    async fn iterate(&self, run: &mut SearchRun, args: &IterativeSearchArgs) -> Termination {
        let stall_limit = self.settings.stall_limit;
        let reflection_frequency = args.reflection_frequency.max(1);
        let gate = QualityGate::new(self.settings.quality.clone(), args.citation_accuracy_threshold);

        for turn in 1..=run.max_iterations {
            run.metrics.total_iterations = turn;
            run.recent_keys.clear();
            let carried = std::mem::take(&mut run.carried_keys);
            let mut new_items = carried.len();
            run.recent_keys.extend(carried);
            let final_turn = turn == run.max_iterations;

            // 1-3. Retrieval
            let (batch, skipped) = run.next_batch(self.settings.max_queries_per_turn);
            if batch.is_empty() && skipped {
                run.repeat_count += 1;
                tracing::info!(turn, repeats = run.repeat_count, "no fresh query this turn");
                if run.repeat_count >= stall_limit {
                    run.log_turn(turn, batch, None, None, new_items);
                    return Termination::RepeatedQueries;
                }
            } else if batch.is_empty() {
                tracing::debug!(turn, carried = new_items, "queue empty, deciding on web results");
            } else {
                run.repeat_count = 0;
                let results = self.retrieve_batch(run, &batch).await;
                for items in results {
                    new_items += run.merge(items, self.settings.max_accumulated_context);
                }
            }

            if turn > 1 && new_items == 0 {
                run.stall_count += 1;
            } else {
                run.stall_count = 0;
            }
            tracing::info!(
                turn,
                queries = ?batch,
                new_items,
                total = run.accumulated.len(),
                "retrieval turn complete"
            );

            if run.stall_count >= stall_limit {
                run.log_turn(turn, batch, None, None, new_items);
                return Termination::ContextStable;
            }

            // 4. Diversity
            let diversity = run.diversity(self.settings.diversity_cap);
            run.metrics.source_diversity = diversity;
            if diversity < self.settings.diversity_threshold
                && run.accumulated.len() >= 3
                && !final_turn
                && !run.diversified
            {
                let extra = planning::diversification_queries(
                    &run.query,
                    run.accumulated.iter().map(|c| c.source_path.as_str()),
                );
                tracing::info!(diversity, queries = ?extra, "diversifying search");
                for q in extra.into_iter().rev() {
                    run.queue.push_front(q);
                }
                run.diversified = true;
            }

            // 5. Flow, reflection, decision
            let flow = run.flow(&self.settings.flow);
            let sources = render_sources(&flow, &run.citations);

            if args.features.reflection && turn % reflection_frequency == 0 && !final_turn {
                let reflection = planning::reflect(
                    self.oracle.as_ref(),
                    &run.query,
                    turn,
                    &sources,
                    run.model.as_deref(),
                    self.settings.call_timeout,
                )
                .await;
                if let Some(q) = &reflection.suggested_query {
                    run.queue.push_back(q.clone());
                }
                run.reflections.push(reflection);
            }

            let decision = match self.decide(run, turn, &sources).await {
                Ok(decision) => decision,
                Err(termination) => {
                    run.log_turn(turn, batch, None, None, new_items);
                    return termination;
                }
            };
            tracing::info!(turn, decision = %decision.decision, reasoning = %decision.reasoning, "oracle decision");

            match decision.decision {
                // 6. ANSWER through the quality gate
                DecisionKind::Answer => {
                    let verdict = gate.evaluate(
                        &run.query,
                        &decision,
                        &run.accumulated,
                        run.citations.len(),
                        final_turn,
                    );
                    let score = verdict.assessment().score;
                    run.metrics.quality_score = score;
                    run.log_turn(turn, batch, Some(DecisionKind::Answer), Some(score), new_items);

                    match verdict {
                        GateVerdict::Accept(_) => {
                            run.record_decision(turn, &decision, None, false);
                            return Termination::Accepted;
                        }
                        GateVerdict::Override { reasons, .. } => {
                            let corrective = planning::corrective_query(
                                &run.query,
                                &decision,
                                &run.accumulated,
                                args.features.corrective_search,
                            );
                            let reasons: Vec<String> = reasons.iter().map(|r| r.to_string()).collect();
                            tracing::info!(
                                turn,
                                reasons = %reasons.join("; "),
                                corrective = %corrective,
                                "quality gate overrode ANSWER"
                            );
                            run.metrics.self_correction_loops += 1;
                            run.record_decision(turn, &decision, Some(corrective.clone()), true);
                            run.queue.push_front(corrective);
                        }
                    }
                }

                // 7. SEARCH_AGAIN
                DecisionKind::SearchAgain => {
                    run.log_turn(turn, batch, Some(DecisionKind::SearchAgain), decision.quality_score, new_items);
                    let next = decision.next_codebase_query.clone();
                    run.record_decision(turn, &decision, next.clone(), false);
                    match next {
                        Some(q) => run.queue.push_back(q),
                        None => return Termination::NoNextAction,
                    }
                }

                // 8. SEARCH_WEB
                DecisionKind::SearchWeb => {
                    run.log_turn(turn, batch, Some(DecisionKind::SearchWeb), decision.quality_score, new_items);
                    if run.web_enabled {
                        let web_query = decision
                            .next_web_query
                            .clone()
                            .or_else(|| decision.next_codebase_query.clone())
                            .unwrap_or_else(|| run.query.clone());
                        run.record_decision(turn, &decision, Some(web_query.clone()), false);

                        let added = self.search_web(run, &web_query).await;
                        if added == 0 {
                            let fallback = decision
                                .next_codebase_query
                                .clone()
                                .unwrap_or(web_query);
                            tracing::info!(turn, fallback = %fallback, "web search empty, searching codebase instead");
                            run.queue.push_back(fallback);
                        } else {
                            run.stall_count = 0;
                        }
                    } else {
                        let next = decision
                            .next_codebase_query
                            .clone()
                            .or_else(|| decision.next_web_query.clone());
                        run.record_decision(turn, &decision, next.clone(), false);
                        match next {
                            Some(q) => run.queue.push_back(q),
                            None => return Termination::NoNextAction,
                        }
                    }
                }
            }
        }

        Termination::MaxIterations
    }

    /// Retrieve every query of a batch concurrently. Channel calls go through
    /// the run cache.
    ///
    /// Results come back in batch order; merging happens in the caller.
    async fn retrieve_batch(&self, run: &mut SearchRun, batch: &[String]) -> Vec<Vec<RetrievedContext>> {
        let coordinator = HybridSearchCoordinator::new(
            self.retriever.as_ref(),
            self.graph.as_deref(),
            self.settings.weights,
            self.settings.rrf_k,
            self.settings.call_timeout,
        )
        .with_cache(&run.cache);

        let options = &run.options;
        let strategy = run.strategy;
        let use_graph = run.use_graph;
        let agent_id = run.agent_id.as_str();
        let results = join_all(batch.iter().map(|query| {
            let coordinator = &coordinator;
            async move {
                match strategy {
                    Strategy::Hybrid => coordinator.search(agent_id, query, options, use_graph).await,
                    Strategy::Graph => coordinator.search(agent_id, query, options, true).await,
                    Strategy::Vector => {
                        coordinator
                            .single_channel(agent_id, query, options, RetrievalMode::Vector)
                            .await
                    }
                    Strategy::Keyword => {
                        coordinator
                            .single_channel(agent_id, query, options, RetrievalMode::Keyword)
                            .await
                    }
                }
            }
        }))
        .await;

        let (hits, misses) = {
            let cache = cache::lock(&run.cache);
            (cache.hits(), cache.misses())
        };
        run.metrics.cache_hits = hits;
        run.metrics.cache_misses = misses;
        results
    }

    /// Ask the oracle for this turn's decision.
    async fn decide(&self, run: &SearchRun, turn: usize, sources: &str) -> Result<Decision, Termination> {
        let reflection_note = run.reflections.last().map(|r| {
            if r.gaps.is_empty() {
                r.assessment.clone()
            } else {
                format!("{} Gaps: {}", r.assessment, r.gaps.join(", "))
            }
        });

        let prompt = DecisionPrompt {
            query: &run.query,
            turn,
            max_iterations: run.max_iterations,
            sources,
            issued_queries: &run.issued_order,
            web_enabled: run.web_enabled,
            reflection_note: reflection_note.as_deref(),
        }
        .render();

        let request = OracleRequest {
            prompt,
            model: run.model.clone(),
            system_instruction: Some(DECISION_SYSTEM.to_string()),
            json_mode: true,
        };

        let reply = ask_within(self.oracle.as_ref(), request, self.settings.call_timeout)
            .await
            .map_err(|e| {
                tracing::warn!(turn, error = %e, "decision call failed");
                Termination::from_oracle_error(e)
            })?;

        parse_decision(&reply.content).map_err(|e| {
            tracing::warn!(turn, error = %e, reply = %truncate_preview(&reply.content, 200), "unparseable decision");
            Termination::ParseFailure(e.to_string())
        })
    }

    /// Run a web search and merge its results as documentation context.
    /// Returns how many new items were added.
    async fn search_web(&self, run: &mut SearchRun, query: &str) -> usize {
        let Some(web) = self.web.as_ref() else {
            return 0;
        };
        run.metrics.web_searches_performed += 1;

        let options = WebSearchOptions {
            max_results: self.settings.web_max_results,
        };
        let results = match tokio::time::timeout(self.settings.call_timeout, web.search(query, &options)).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                tracing::warn!(query, error = %e, "web search failed");
                return 0;
            }
            Err(_) => {
                tracing::warn!(query, "web search timed out");
                return 0;
            }
        };

        let items: Vec<RetrievedContext> = results.iter().map(web_result_to_context).collect();
        run.web_sources.extend(results.into_iter().map(|r| WebSource {
            title: r.title,
            url: r.url,
            content: r.content,
        }));
        let before = run.accumulated.len();
        let added = run.merge(items, self.settings.max_accumulated_context);
        let keys: Vec<String> = run.accumulated[before..].iter().map(|c| c.dedup_key()).collect();
        run.carried_keys.extend(keys);
        added
    }

    // ── Conclusion ────────────────────────────────────────────────────────────

    async fn conclude(&self, mut run: SearchRun, termination: Termination) -> IterativeRagResult {
        let reason = termination.reason(self.settings.stall_limit);
        tracing::info!(
            reason = %reason,
            iterations = run.metrics.total_iterations,
            context = run.accumulated.len(),
            "iterative search finished"
        );

        // A blank question has nothing to ask the oracle about.
        let final_answer = if termination.oracle_failed() || run.query.is_empty() {
            fallback_summary(&run, &reason)
        } else {
            let mode = match termination {
                Termination::Accepted => AnswerMode::Accepted,
                _ if !run.accumulated.is_empty() => AnswerMode::Forced,
                _ if run.web_enabled && !run.query.is_empty() => {
                    let query = run.query.clone();
                    if self.search_web(&mut run, &query).await > 0 {
                        AnswerMode::WebFallback
                    } else {
                        AnswerMode::EmptyContext
                    }
                }
                _ => AnswerMode::EmptyContext,
            };
            self.final_answer(&run, mode, &reason).await
        };

        let validation = run.citations.validate(&final_answer);
        run.metrics.citation_accuracy = validation.accuracy;
        run.metrics.citation_coverage = validation.coverage;
        run.metrics.citation_quality = validation.quality;
        run.metrics.source_diversity = run.diversity(self.settings.diversity_cap);
        if run.metrics.quality_score == 0.0 && !run.accumulated.is_empty() {
            run.metrics.quality_score =
                crate::rag::quality::estimate_quality(&run.query, &run.accumulated).score;
        }
        run.metrics.termination_reason = reason;

        IterativeRagResult {
            accumulated_context: run.accumulated,
            web_search_sources: run.web_sources,
            final_answer,
            decision_log: run.decision_log,
            citations: run.citations.citations().to_vec(),
            reflection_results: run.reflections,
            agentic_plan: run.plan,
            search_metrics: run.metrics,
        }
    }

    async fn final_answer(&self, run: &SearchRun, mode: AnswerMode, reason: &str) -> String {
        // The final prompt shows everything, not just this turn's additions.
        let all_keys: HashSet<String> = run.accumulated.iter().map(|c| c.dedup_key()).collect();
        let flow = build_context_flow(
            &run.accumulated,
            &all_keys,
            run.chunk_size,
            &self.settings.flow,
        );
        let sources = render_sources(&flow, &run.citations);
        let prompt = AnswerPrompt {
            query: &run.query,
            mode,
            sources: &sources,
            web_sources: &run.web_sources,
        }
        .render();

        let request = OracleRequest {
            prompt,
            model: run.model.clone(),
            system_instruction: Some(ANSWER_SYSTEM.to_string()),
            json_mode: false,
        };

        match ask_within(self.oracle.as_ref(), request, self.settings.call_timeout).await {
            Ok(reply) if !reply.content.trim().is_empty() => reply.content.trim().to_string(),
            Ok(_) => {
                tracing::warn!("final answer was empty");
                fallback_summary(run, reason)
            }
            Err(e) => {
                tracing::warn!(error = %e, "final answer call failed");
                fallback_summary(run, &format!("{reason}; {e}"))
            }
        }
    }
}

fn web_result_to_context(result: &WebResult) -> RetrievedContext {
    let mut item = RetrievedContext::new(ContextKind::Documentation, result.url.clone(), result.content.clone())
        .with_entity(result.title.clone())
        .with_relevance(result.score.unwrap_or(DEFAULT_WEB_RELEVANCE).clamp(0.0, 1.0));
    item.metadata_mut().channels.push(SearchChannel::Web);
    item
}

/// Deterministic answer used when the oracle cannot be asked.
fn fallback_summary(run: &SearchRun, reason: &str) -> String {
    if run.accumulated.is_empty() {
        return format!(
            "Unable to answer \"{}\" ({reason}). No relevant context was retrieved.",
            run.query
        );
    }

    let mut ranked: Vec<&RetrievedContext> = run.accumulated.iter().collect();
    ranked.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = format!(
        "Unable to generate an answer for \"{}\" ({reason}). Most relevant context found:\n",
        run.query
    );
    for item in ranked.into_iter().take(5) {
        let id = run.citations.id_for(&item.dedup_key()).unwrap_or_default();
        let name = item
            .entity_name
            .as_deref()
            .map(|n| format!(" {n}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "- [{id}] {}{name} ({}): {}\n",
            item.source_path,
            item.kind,
            truncate_preview(item.content.trim(), 100)
        ));
    }
    out
}
