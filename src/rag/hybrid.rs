//! Hybrid search: vector, keyword and graph channels queried concurrently and
//! fused with weighted Reciprocal Rank Fusion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

use crate::config::RetrievalConfig;
use crate::providers::{ContextRetriever, GraphNode, GraphQuery, RetrievalMode, RetrievalOptions};
use crate::rag::cache::{self, ContextCache};
use crate::rag::text::query_terms;
use crate::rag::types::{ContextKind, RetrievedContext, SearchChannel};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Per-channel RRF weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelWeights {
    pub vector: f64,
    pub keyword: f64,
    pub graph: f64,
}

impl Default for ChannelWeights {
    fn default() -> Self {
        Self {
            vector: 1.0,
            keyword: 0.8,
            graph: 0.9,
        }
    }
}

impl ChannelWeights {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            vector: config.vector_weight,
            keyword: config.keyword_weight,
            graph: config.graph_weight,
        }
    }

    pub fn for_channel(&self, channel: SearchChannel) -> f64 {
        match channel {
            SearchChannel::Vector => self.vector,
            SearchChannel::Keyword => self.keyword,
            SearchChannel::Graph => self.graph,
            SearchChannel::Web => 0.0,
        }
    }
}

/// One channel's ranked output, best first.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub channel: SearchChannel,
    pub weight: f64,
    pub items: Vec<RetrievedContext>,
}

pub struct HybridSearchCoordinator<'a> {
    retriever: &'a dyn ContextRetriever,
    graph: Option<&'a dyn GraphQuery>,
    weights: ChannelWeights,
    rrf_k: usize,
    timeout: Duration,
    cache: Option<&'a Mutex<ContextCache>>,
}

// ── Coordinator ───────────────────────────────────────────────────────────────

impl<'a> HybridSearchCoordinator<'a> {
    pub fn new(
        retriever: &'a dyn ContextRetriever,
        graph: Option<&'a dyn GraphQuery>,
        weights: ChannelWeights,
        rrf_k: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            retriever,
            graph,
            weights,
            rrf_k,
            timeout,
            cache: None,
        }
    }

    /// Serve repeated channel calls from `cache`.
    pub fn with_cache(mut self, cache: &'a Mutex<ContextCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Fan the query out to every applicable channel and fuse the rankings.
    ///
    /// The graph channel runs only when `include_graph` is set and a graph
    /// backend is wired. Failed or timed-out channels contribute nothing.
    pub async fn search(
        &self,
        agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
        include_graph: bool,
    ) -> Vec<RetrievedContext> {
        let vector_options = options.with_mode(RetrievalMode::Vector);
        let keyword_options = options.with_mode(RetrievalMode::Keyword);
        let keyword_query = query_terms(query).join(" ");

        let vector = self.channel(
            SearchChannel::Vector,
            query,
            &vector_options,
            self.retriever
                .retrieve_context(agent_id, query, &vector_options),
        );
        let keyword = self.channel(
            SearchChannel::Keyword,
            &keyword_query,
            &keyword_options,
            self.retriever
                .retrieve_context(agent_id, &keyword_query, &keyword_options),
        );
        let graph = async {
            match self.graph {
                Some(graph) if include_graph => {
                    self.channel(SearchChannel::Graph, query, options, async {
                        let result = graph.query_graph(agent_id, query).await?;
                        Ok::<_, anyhow::Error>(graph_nodes_to_context(&result.nodes, options))
                    })
                    .await
                }
                _ => Vec::new(),
            }
        };

        let (vector, keyword, graph) = tokio::join!(vector, keyword, graph);
        tracing::debug!(
            query,
            vector = vector.len(),
            keyword = keyword.len(),
            graph = graph.len(),
            "hybrid channels returned"
        );

        let lists = [
            RankedList {
                channel: SearchChannel::Vector,
                weight: self.weights.vector,
                items: vector,
            },
            RankedList {
                channel: SearchChannel::Keyword,
                weight: self.weights.keyword,
                items: keyword,
            },
            RankedList {
                channel: SearchChannel::Graph,
                weight: self.weights.graph,
                items: graph,
            },
        ];

        let mut fused = apply_hybrid_ranking(&lists, self.rrf_k);
        fused.truncate(options.max_results);
        fused
    }

    /// Query one retrieval channel directly, without fusion.
    pub async fn single_channel(
        &self,
        agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
        mode: RetrievalMode,
    ) -> Vec<RetrievedContext> {
        let (channel, query) = match mode {
            RetrievalMode::Vector => (SearchChannel::Vector, query.to_string()),
            RetrievalMode::Keyword => (SearchChannel::Keyword, query_terms(query).join(" ")),
        };
        let options = options.with_mode(mode);
        self.channel(
            channel,
            &query,
            &options,
            self.retriever.retrieve_context(agent_id, &query, &options),
        )
        .await
    }

    /// One channel call, served from the cache when possible.
    ///
    /// `query` is the text the channel receives. `fut` is only polled on a
    /// miss, and only successful fetches are stored.
    async fn channel<F>(
        &self,
        channel: SearchChannel,
        query: &str,
        options: &RetrievalOptions,
        fut: F,
    ) -> Vec<RetrievedContext>
    where
        F: Future<Output = Result<Vec<RetrievedContext>>>,
    {
        let key = ContextCache::key(channel, query, options);
        if let Some(hit) = self.cache.and_then(|c| cache::lock(c).get(&key)) {
            tracing::debug!(%channel, query, "retrieval cache hit");
            return hit;
        }

        match fetch(channel, self.timeout, fut).await {
            Some(items) => {
                if let Some(c) = self.cache {
                    cache::lock(c).insert(key, query, options, items.clone());
                }
                items
            }
            None => Vec::new(),
        }
    }
}

/// Await a channel under a deadline and tag its items with the channel.
/// Errors and timeouts are logged and yield `None`.
async fn fetch<F>(channel: SearchChannel, timeout: Duration, fut: F) -> Option<Vec<RetrievedContext>>
where
    F: Future<Output = Result<Vec<RetrievedContext>>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(mut items)) => {
            for item in &mut items {
                let channels = &mut item.metadata_mut().channels;
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
            }
            Some(items)
        }
        Ok(Err(e)) => {
            tracing::warn!(%channel, error = %e, "retrieval channel failed");
            None
        }
        Err(_) => {
            tracing::warn!(%channel, timeout_ms = timeout.as_millis() as u64, "retrieval channel timed out");
            None
        }
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

/// Weighted Reciprocal Rank Fusion.
///
/// Each item at 0-based rank `r` in a list of weight `w` contributes
/// `w / (k + r + 1)`. Contributions for the same dedup key are summed; the
/// first occurrence supplies the item body. Output is sorted by fused score
/// descending with ties kept in first-seen order.
pub fn apply_hybrid_ranking(lists: &[RankedList], k: usize) -> Vec<RetrievedContext> {
    let mut fused: Vec<(RetrievedContext, f64)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for list in lists {
        for (rank, item) in list.items.iter().enumerate() {
            let contribution = list.weight / (k as f64 + rank as f64 + 1.0);
            let key = item.dedup_key();

            match index.get(&key) {
                Some(&pos) => {
                    let (existing, score) = &mut fused[pos];
                    *score += contribution;
                    let channels = &mut existing.metadata_mut().channels;
                    if !channels.contains(&list.channel) {
                        channels.push(list.channel);
                    }
                }
                None => {
                    let mut entry = item.clone();
                    let channels = &mut entry.metadata_mut().channels;
                    if !channels.contains(&list.channel) {
                        channels.push(list.channel);
                    }
                    index.insert(key, fused.len());
                    fused.push((entry, contribution));
                }
            }
        }
    }

    // Stable sort keeps first-seen order among equal scores.
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    fused
        .into_iter()
        .map(|(mut item, score)| {
            item.metadata_mut().fused_score = Some(score);
            item
        })
        .collect()
}

/// Map graph nodes onto context items, honoring the kind and relevance filters.
pub fn graph_nodes_to_context(nodes: &[GraphNode], options: &RetrievalOptions) -> Vec<RetrievedContext> {
    if !options.accepts(ContextKind::GraphNode) {
        return Vec::new();
    }

    nodes
        .iter()
        .filter(|node| node.score >= options.min_relevance)
        .map(|node| {
            let source = if node.source_path.is_empty() {
                node.id.clone()
            } else {
                node.source_path.clone()
            };
            let mut item = RetrievedContext::new(ContextKind::GraphNode, source, node.content.clone())
                .with_entity(node.name.clone())
                .with_relevance(node.score);
            let meta = item.metadata_mut();
            meta.node_type = Some(node.node_type.clone());
            meta.start_line = node.start_line;
            meta.end_line = node.end_line;
            item
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::GraphQueryResult;
    use async_trait::async_trait;

    fn item(path: &str, relevance: f64) -> RetrievedContext {
        RetrievedContext::new(ContextKind::Function, path, format!("fn in {path}")).with_relevance(relevance)
    }

    fn list(channel: SearchChannel, weight: f64, paths: &[&str]) -> RankedList {
        RankedList {
            channel,
            weight,
            items: paths.iter().map(|p| item(p, 0.5)).collect(),
        }
    }

    fn paths(items: &[RetrievedContext]) -> Vec<&str> {
        items.iter().map(|i| i.source_path.as_str()).collect()
    }

    #[test]
    fn fusion_sums_scores_across_channels() {
        let lists = [
            list(SearchChannel::Vector, 1.0, &["a", "b", "c"]),
            list(SearchChannel::Keyword, 0.8, &["b", "a", "d"]),
        ];
        let fused = apply_hybrid_ranking(&lists, 60);

        assert_eq!(paths(&fused), vec!["a", "b", "c", "d"]);
        let a = fused[0].metadata.as_ref().unwrap();
        let expected = 1.0 / 61.0 + 0.8 / 62.0;
        assert!((a.fused_score.unwrap() - expected).abs() < 1e-12);
        assert_eq!(a.channels, vec![SearchChannel::Vector, SearchChannel::Keyword]);
    }

    #[test]
    fn fusion_is_deterministic_and_ties_keep_first_seen_order() {
        let lists = [
            list(SearchChannel::Vector, 1.0, &["x"]),
            list(SearchChannel::Keyword, 1.0, &["y"]),
        ];
        for _ in 0..20 {
            let fused = apply_hybrid_ranking(&lists, 60);
            assert_eq!(paths(&fused), vec!["x", "y"]);
        }
    }

    #[test]
    fn fusion_keeps_provider_relevance() {
        let lists = [RankedList {
            channel: SearchChannel::Vector,
            weight: 1.0,
            items: vec![item("a", 0.91)],
        }];
        let fused = apply_hybrid_ranking(&lists, 60);
        assert!((fused[0].relevance_score - 0.91).abs() < f64::EPSILON);
    }

    #[test]
    fn graph_weight_can_promote_graph_hits() {
        let lists = [
            list(SearchChannel::Vector, 1.0, &["v1", "v2"]),
            list(SearchChannel::Graph, 0.9, &["g1"]),
        ];
        let fused = apply_hybrid_ranking(&lists, 60);
        // 0.9/61 > 1.0/62
        assert_eq!(paths(&fused), vec!["v1", "g1", "v2"]);
    }

    #[test]
    fn graph_nodes_respect_kind_filter() {
        let node = GraphNode {
            id: "n1".into(),
            name: "Parser".into(),
            node_type: "class".into(),
            source_path: "src/parser.rs".into(),
            content: "struct Parser".into(),
            score: 0.7,
            start_line: Some(3),
            end_line: Some(9),
        };
        let all = graph_nodes_to_context(std::slice::from_ref(&node), &RetrievalOptions::default());
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entity_name.as_deref(), Some("Parser"));
        assert_eq!(all[0].line_range().map(|r| (r.start, r.end)), Some((3, 9)));

        let mut only_functions = RetrievalOptions::default();
        only_functions.kinds = vec![ContextKind::Function];
        assert!(graph_nodes_to_context(&[node], &only_functions).is_empty());
    }

    struct SplitRetriever;

    #[async_trait]
    impl ContextRetriever for SplitRetriever {
        async fn retrieve_context(
            &self,
            _agent_id: &str,
            _query: &str,
            options: &RetrievalOptions,
        ) -> Result<Vec<RetrievedContext>> {
            match options.mode {
                RetrievalMode::Vector => Ok(vec![item("vec.rs", 0.9)]),
                RetrievalMode::Keyword => anyhow::bail!("fts index unavailable"),
            }
        }
    }

    struct SlowGraph;

    #[async_trait]
    impl GraphQuery for SlowGraph {
        async fn query_graph(&self, _agent_id: &str, _query: &str) -> Result<GraphQueryResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GraphQueryResult::default())
        }
    }

    #[tokio::test]
    async fn failing_and_slow_channels_contribute_nothing() {
        let retriever = SplitRetriever;
        let graph = SlowGraph;
        let coordinator = HybridSearchCoordinator::new(
            &retriever,
            Some(&graph),
            ChannelWeights::default(),
            60,
            Duration::from_millis(50),
        );

        let results = coordinator
            .search("agent", "parse config", &RetrievalOptions::default(), true)
            .await;
        assert_eq!(paths(&results), vec!["vec.rs"]);
        let meta = results[0].metadata.as_ref().unwrap();
        assert_eq!(meta.channels, vec![SearchChannel::Vector]);
    }

    #[tokio::test]
    async fn single_channel_failure_is_empty() {
        let retriever = SplitRetriever;
        let coordinator = HybridSearchCoordinator::new(
            &retriever,
            None,
            ChannelWeights::default(),
            60,
            Duration::from_secs(1),
        );
        let results = coordinator
            .single_channel("agent", "q", &RetrievalOptions::default(), RetrievalMode::Keyword)
            .await;
        assert!(results.is_empty());
    }

    struct CountingRetriever {
        calls: std::sync::Mutex<Vec<(String, RetrievalMode)>>,
        fail_vector: bool,
    }

    #[async_trait]
    impl ContextRetriever for CountingRetriever {
        async fn retrieve_context(
            &self,
            _agent_id: &str,
            query: &str,
            options: &RetrievalOptions,
        ) -> Result<Vec<RetrievedContext>> {
            self.calls.lock().unwrap().push((query.to_string(), options.mode));
            if self.fail_vector && options.mode == RetrievalMode::Vector {
                anyhow::bail!("vector index offline");
            }
            let path = match options.mode {
                RetrievalMode::Vector => "vector.rs",
                RetrievalMode::Keyword => "keyword.rs",
            };
            Ok(vec![item(path, 0.8)])
        }
    }

    fn counting(fail_vector: bool) -> CountingRetriever {
        CountingRetriever {
            calls: std::sync::Mutex::new(Vec::new()),
            fail_vector,
        }
    }

    fn run_cache() -> Mutex<ContextCache> {
        Mutex::new(ContextCache::new(&crate::config::CacheConfig::default()))
    }

    #[tokio::test]
    async fn keyword_channel_is_cached_on_its_effective_query() {
        let retriever = counting(false);
        let cache = run_cache();
        let coordinator = HybridSearchCoordinator::new(
            &retriever,
            None,
            ChannelWeights::default(),
            60,
            Duration::from_secs(1),
        )
        .with_cache(&cache);
        let options = RetrievalOptions::default();

        coordinator.search("agent", "how does the cache work", &options, false).await;
        let second = coordinator.search("agent", "cache work", &options, false).await;

        let calls = retriever.calls.lock().unwrap().clone();
        let keyword_calls: Vec<&str> = calls
            .iter()
            .filter(|(_, mode)| *mode == RetrievalMode::Keyword)
            .map(|(q, _)| q.as_str())
            .collect();
        assert_eq!(keyword_calls, vec!["cache"]);
        assert_eq!(calls.len(), 3);
        assert_eq!(paths(&second), vec!["vector.rs", "keyword.rs"]);

        let cache = cache::lock(&cache);
        assert_eq!((cache.hits(), cache.misses()), (1, 3));
    }

    #[tokio::test]
    async fn failed_channels_are_not_cached() {
        let retriever = counting(true);
        let cache = run_cache();
        let coordinator = HybridSearchCoordinator::new(
            &retriever,
            None,
            ChannelWeights::default(),
            60,
            Duration::from_secs(1),
        )
        .with_cache(&cache);
        let options = RetrievalOptions::default();

        for _ in 0..2 {
            coordinator
                .single_channel("agent", "parse config", &options, RetrievalMode::Vector)
                .await;
        }
        assert_eq!(retriever.calls.lock().unwrap().len(), 2);
        assert!(cache::lock(&cache).is_empty());
    }
}
