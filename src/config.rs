use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct QuarryConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub oracle: OracleConfig,
    pub web_search: WebSearchConfig,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub flow: FlowConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub default_agent: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"hashing"` (offline feature hashing) or `"http"` (OpenAI-compatible endpoint).
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub api_base: String,
    pub path: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_max_results: usize,
    pub rrf_k: usize,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub graph_weight: f64,
    /// Query the knowledge graph on every hybrid search, not only when a plan asks for it.
    pub always_query_graph: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OracleConfig {
    pub api_base: String,
    pub path: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebSearchConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key: String,
    pub max_results: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_max_iterations: usize,
    pub max_iterations_cap: usize,
    pub max_queries_per_turn: usize,
    /// Consecutive stalled turns (no new context, or only repeated queries) before giving up.
    pub stall_limit: usize,
    pub diversity_cap: usize,
    pub diversity_threshold: f64,
    pub max_accumulated_context: usize,
    /// Deadline applied to every oracle, retrieval, and web-search call.
    pub call_timeout_ms: u64,
    pub reflection_frequency: usize,
    pub chunk_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// High-water mark; inserting past it purges the oldest `evict_fraction` of entries.
    pub max_entries: usize,
    pub evict_fraction: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FlowConfig {
    pub older_cap_trigger: usize,
    pub older_keep: usize,
    pub older_min_relevance: f64,
    pub max_items: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QualityConfig {
    pub min_quality: f64,
    pub min_context_items: usize,
    pub min_confidence: f64,
    pub citation_threshold: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            host: "127.0.0.1".into(),
            port: 7410,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_quarry_dir()
            .join("knowledge.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            default_agent: "default".into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".into(),
            model: "feature-hash-v1".into(),
            dimensions: 384,
            api_base: "https://api.openai.com/v1".into(),
            path: "/embeddings".into(),
            api_key: String::new(),
            timeout_ms: 30_000,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_max_results: 10,
            rrf_k: 60,
            vector_weight: 1.0,
            keyword_weight: 0.8,
            graph_weight: 0.9,
            always_query_graph: false,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            path: "/chat/completions".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            timeout_ms: 60_000,
        }
    }
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://api.tavily.com".into(),
            api_key: String::new(),
            max_results: 5,
            timeout_ms: 20_000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 5,
            max_iterations_cap: 8,
            max_queries_per_turn: 3,
            stall_limit: 2,
            diversity_cap: 10,
            diversity_threshold: 0.5,
            max_accumulated_context: 200,
            call_timeout_ms: 60_000,
            reflection_frequency: 2,
            chunk_size: 2000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 100,
            evict_fraction: 0.3,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            older_cap_trigger: 10,
            older_keep: 5,
            older_min_relevance: 0.8,
            max_items: 40,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_quality: 0.55,
            min_context_items: 6,
            min_confidence: 0.6,
            citation_threshold: 0.65,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Returns `~/.quarry/`
pub fn default_quarry_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quarry")
}

/// Returns the default config file path: `~/.quarry/config.toml`
pub fn default_config_path() -> PathBuf {
    default_quarry_dir().join("config.toml")
}

impl QuarryConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            QuarryConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// `QUARRY_DB`, `QUARRY_AGENT`, `QUARRY_LOG_LEVEL`, `QUARRY_ORACLE_API_KEY`,
    /// `QUARRY_ORACLE_MODEL`, `QUARRY_WEB_API_KEY`.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("QUARRY_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("QUARRY_AGENT") {
            self.storage.default_agent = val;
        }
        if let Ok(val) = std::env::var("QUARRY_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("QUARRY_ORACLE_API_KEY") {
            self.oracle.api_key = val;
        }
        if let Ok(val) = std::env::var("QUARRY_ORACLE_MODEL") {
            self.oracle.model = val;
        }
        if let Ok(val) = std::env::var("QUARRY_WEB_API_KEY") {
            self.web_search.api_key = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = QuarryConfig::default();
        assert_eq!(config.server.transport, "stdio");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.storage.default_agent, "default");
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.orchestrator.default_max_iterations, 5);
        assert_eq!(config.orchestrator.max_iterations_cap, 8);
        assert!((config.cache.evict_fraction - 0.3).abs() < f64::EPSILON);
        assert!(config.storage.db_path.ends_with("knowledge.db"));
        assert!(!config.web_search.enabled);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"
default_agent = "indexer"

[retrieval]
keyword_weight = 0.5

[quality]
min_quality = 0.7
"#;
        let config: QuarryConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.storage.default_agent, "indexer");
        assert!((config.retrieval.keyword_weight - 0.5).abs() < f64::EPSILON);
        assert!((config.quality.min_quality - 0.7).abs() < f64::EPSILON);
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.rrf_k, 60);
        assert!((config.retrieval.vector_weight - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.quality.min_context_items, 6);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = QuarryConfig::default();
        std::env::set_var("QUARRY_DB", "/tmp/override.db");
        std::env::set_var("QUARRY_AGENT", "env-agent");
        std::env::set_var("QUARRY_ORACLE_API_KEY", "sk-test");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.storage.default_agent, "env-agent");
        assert_eq!(config.oracle.api_key, "sk-test");

        // Clean up
        std::env::remove_var("QUARRY_DB");
        std::env::remove_var("QUARRY_AGENT");
        std::env::remove_var("QUARRY_ORACLE_API_KEY");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/q.db"), PathBuf::from("/var/lib/q.db"));
    }
}
