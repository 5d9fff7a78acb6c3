//! Run-scoped retrieval cache.
//!
//! One entry per channel call. Keys hash the channel, the query that channel
//! actually receives (normalized), and the filtering options. An entry older
//! than the TTL is a miss and is dropped on read; inserting past the
//! high-water mark purges the oldest fraction of entries by timestamp.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::providers::RetrievalOptions;
use crate::rag::text::normalize_query;
use crate::rag::types::{RetrievedContext, SearchChannel};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub context: Vec<RetrievedContext>,
    pub timestamp: Instant,
    pub query: String,
    pub options: RetrievalOptions,
}

#[derive(Debug)]
pub struct ContextCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    evict_fraction: f64,
    hits: usize,
    misses: usize,
}

/// Lock a shared cache. Entries stay consistent across a panicking holder, so
/// poisoning is ignored.
pub fn lock(cache: &Mutex<ContextCache>) -> MutexGuard<'_, ContextCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ContextCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            evict_fraction: config.evict_fraction.clamp(0.0, 1.0),
            hits: 0,
            misses: 0,
        }
    }

    /// Deterministic key for one channel call.
    ///
    /// `query` is the text the channel receives, so two questions that reduce
    /// to the same keyword terms share a keyword entry.
    pub fn key(channel: SearchChannel, query: &str, options: &RetrievalOptions) -> String {
        let mut kinds: Vec<&str> = options.kinds.iter().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();

        let payload = serde_json::json!({
            "channel": channel.as_str(),
            "query": normalize_query(query),
            "max_results": options.max_results,
            "kinds": kinds,
            "min_relevance": format!("{:.4}", options.min_relevance),
        });

        let mut hasher = DefaultHasher::new();
        payload.to_string().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<RetrievedContext>> {
        self.get_at(key, Instant::now())
    }

    /// Read an entry as of `now`. Expired entries are removed and reported as a miss.
    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<Vec<RetrievedContext>> {
        let expired = match self.entries.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => now.saturating_duration_since(entry.timestamp) >= self.ttl,
        };

        if expired {
            self.entries.remove(key);
            self.misses += 1;
            tracing::debug!(key, "cache entry expired");
            return None;
        }

        self.hits += 1;
        self.entries.get(key).map(|entry| entry.context.clone())
    }

    pub fn insert(
        &mut self,
        key: String,
        query: &str,
        options: &RetrievalOptions,
        context: Vec<RetrievedContext>,
    ) {
        self.insert_at(key, query, options, context, Instant::now());
    }

    pub fn insert_at(
        &mut self,
        key: String,
        query: &str,
        options: &RetrievalOptions,
        context: Vec<RetrievedContext>,
        now: Instant,
    ) {
        self.entries.insert(
            key,
            CacheEntry {
                context,
                timestamp: now,
                query: query.to_string(),
                options: options.clone(),
            },
        );

        if self.entries.len() > self.max_entries {
            let evicted = self.evict_oldest();
            tracing::debug!(evicted, remaining = self.entries.len(), "cache over high-water mark");
        }
    }

    /// Purge the oldest `evict_fraction` of entries (at least one). Returns the count removed.
    fn evict_oldest(&mut self) -> usize {
        let count = ((self.entries.len() as f64) * self.evict_fraction).ceil() as usize;
        let count = count.max(1);

        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.timestamp, k.clone()))
            .collect();
        by_age.sort();

        for (_, key) in by_age.into_iter().take(count) {
            self.entries.remove(&key);
        }
        count
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::ContextKind;

    fn cache(ttl_secs: u64, max_entries: usize) -> ContextCache {
        ContextCache::new(&CacheConfig {
            ttl_secs,
            max_entries,
            evict_fraction: 0.3,
        })
    }

    fn item(path: &str) -> RetrievedContext {
        RetrievedContext::new(ContextKind::File, path, "body").with_relevance(0.5)
    }

    #[test]
    fn key_is_stable_and_normalized() {
        let options = RetrievalOptions::default();
        let a = ContextCache::key(SearchChannel::Vector, "Parse Config", &options);
        let b = ContextCache::key(SearchChannel::Vector, "  parse   config ", &options);
        assert_eq!(a, b);

        assert_ne!(a, ContextCache::key(SearchChannel::Keyword, "parse config", &options));

        let mut narrower = options.clone();
        narrower.max_results = 3;
        assert_ne!(a, ContextCache::key(SearchChannel::Vector, "parse config", &narrower));
    }

    #[test]
    fn key_ignores_kind_order() {
        let mut first = RetrievalOptions::default();
        first.kinds = vec![ContextKind::Function, ContextKind::Class];
        let mut second = RetrievalOptions::default();
        second.kinds = vec![ContextKind::Class, ContextKind::Function];
        assert_eq!(
            ContextCache::key(SearchChannel::Keyword, "q", &first),
            ContextCache::key(SearchChannel::Keyword, "q", &second)
        );
    }

    #[test]
    fn hit_within_ttl() {
        let mut cache = cache(60, 10);
        let options = RetrievalOptions::default();
        let start = Instant::now();
        cache.insert_at("k".into(), "q", &options, vec![item("a.rs")], start);

        let hit = cache.get_at("k", start + Duration::from_secs(59));
        assert_eq!(hit.map(|c| c.len()), Some(1));
        assert!(cache.get_at("other", start).is_none());
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn read_after_ttl_is_a_miss_and_evicts() {
        let mut cache = cache(60, 10);
        let options = RetrievalOptions::default();
        let start = Instant::now();
        cache.insert_at("k".into(), "q", &options, vec![item("a.rs")], start);

        assert!(cache.get_at("k", start + Duration::from_secs(60)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn oversize_purges_oldest_thirty_percent() {
        let mut cache = cache(600, 10);
        let options = RetrievalOptions::default();
        let start = Instant::now();
        for i in 0..11u64 {
            cache.insert_at(
                format!("k{i}"),
                "q",
                &options,
                vec![item("a.rs")],
                start + Duration::from_secs(i),
            );
        }

        // 11 entries > 10 → ceil(11 * 0.3) = 4 oldest removed
        assert_eq!(cache.len(), 7);
        let later = start + Duration::from_secs(20);
        for i in 0..4 {
            assert!(cache.get_at(&format!("k{i}"), later).is_none());
        }
        assert!(cache.get_at("k4", later).is_some());
        assert!(cache.get_at("k10", later).is_some());
    }
}
