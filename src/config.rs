//! Configuration parsing and validation.
//!
//! Recall Harness is configured via a TOML file (default:
//! `./config/recall.toml`). Every option has a default, so an empty file —
//! or no file at all — yields a working configuration that watches the
//! host application's log directory and embeds locally.
//!
//! # Sections
//!
//! - `[ingest]` — log roots, state file, temperature windows, loop cadence
//! - `[chunking]` — token/char limits, overlap, tool-output caps
//! - `[embedding]` — provider selection, remote budget, retry tuning
//! - `[store]` — vector store URL and timeouts
//! - `[retrieval]` — result limits and time-decay re-ranking
//! - `[resources]` — memory and CPU guards for the ingestion loop
//! - `[server]` — RPC bind address

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub store: StoreConfig,
    pub retrieval: RetrievalConfig,
    pub resources: ResourcesConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Directories scanned for `*.jsonl` transcripts. Layout is
    /// `<root>/<encoded-project-path>/<conversation-uuid>.jsonl`.
    pub log_roots: Vec<PathBuf>,
    /// Ingest-state location. Resolved to absolute; parent created if
    /// missing.
    pub state_file: PathBuf,
    /// Files younger than this are HOT.
    pub hot_window_secs: u64,
    /// Files older than this are COLD.
    pub warm_window_secs: u64,
    /// A WARM file queued longer than this is promoted to URGENT_WARM.
    pub max_warm_wait_secs: u64,
    /// Loop sleep while any HOT work exists.
    pub hot_check_interval_secs: u64,
    /// Loop sleep otherwise.
    pub import_frequency_secs: u64,
    /// COLD files admitted per scan cycle.
    pub max_cold_per_cycle: usize,
    /// Queue capacity; overflow defers COLD work, never drops HOT.
    pub max_queue: usize,
    /// Consecutive failures before a file is quarantined.
    pub max_file_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            log_roots: default_log_roots(),
            state_file: default_state_file(),
            hot_window_secs: 300,
            warm_window_secs: 86_400,
            max_warm_wait_secs: 1_800,
            hot_check_interval_secs: 2,
            import_frequency_secs: 60,
            max_cold_per_cycle: 5,
            max_queue: 256,
            max_file_retries: 5,
        }
    }
}

fn default_log_roots() -> Vec<PathBuf> {
    match dirs::home_dir() {
        Some(home) => vec![home.join(".claude").join("projects")],
        None => vec![PathBuf::from("./logs")],
    }
}

fn default_state_file() -> PathBuf {
    match dirs::data_dir() {
        Some(data) => data.join("recall-harness").join("ingest-state.json"),
        None => PathBuf::from("./data/ingest-state.json"),
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_token_limit: usize,
    pub chunk_char_limit: usize,
    pub overlap_tokens: usize,
    pub overlap_chars: usize,
    /// Characters per estimated token; deliberately conservative.
    pub token_char_ratio: usize,
    pub max_tool_outputs: usize,
    pub max_tool_output_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_token_limit: 400,
            chunk_char_limit: 1600,
            overlap_tokens: 75,
            overlap_chars: 300,
            token_char_ratio: 3,
            max_tool_outputs: 15,
            max_tool_output_chars: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (in-process ONNX, 384-dim), `voyage` (remote HTTP,
    /// 1024-dim), or `hash` (deterministic offline fallback).
    pub provider: String,
    /// Model override. Defaults per provider.
    pub model: Option<String>,
    /// Voyage API key; the `VOYAGE_API_KEY` environment variable wins.
    pub voyage_api_key: Option<String>,
    /// Hard per-request token budget for the remote provider. The service
    /// documents 120 000; the default leaves a 20 000-token safety margin.
    pub remote_token_budget: usize,
    pub use_token_aware_batching: bool,
    /// Model download + first-load deadline for the local provider.
    pub init_timeout_secs: u64,
    /// Per-call timeout for embed requests.
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Model cache directory for the local provider.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
            voyage_api_key: None,
            remote_token_budget: 100_000,
            use_token_aware_batching: true,
            init_timeout_secs: 120,
            timeout_secs: 30,
            max_retries: 6,
            cache_dir: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn voyage_key(&self) -> Option<String> {
        std::env::var("VOYAGE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.voyage_api_key.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// Qdrant-compatible vector store base URL.
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    /// Server default for decay re-ranking; requests may override.
    pub enable_memory_decay: bool,
    pub decay_weight: f64,
    pub decay_scale_days: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            enable_memory_decay: false,
            decay_weight: 0.3,
            decay_scale_days: 90,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Operational memory allowance over the post-init baseline, in MB.
    pub operational_memory_limit_mb: u64,
    /// Sliding-average CPU ceiling, percent of one effective core.
    pub max_cpu_percent_per_core: f32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            operational_memory_limit_mb: 500,
            max_cpu_percent_per_core: 50.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7860".to_string(),
        }
    }
}

impl Config {
    pub fn hot_window(&self) -> Duration {
        Duration::from_secs(self.ingest.hot_window_secs)
    }
    pub fn warm_window(&self) -> Duration {
        Duration::from_secs(self.ingest.warm_window_secs)
    }
    pub fn max_warm_wait(&self) -> Duration {
        Duration::from_secs(self.ingest.max_warm_wait_secs)
    }
}

/// Load and validate configuration. A missing file yields defaults so the
/// binary works out of the box.
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    if config.chunking.chunk_token_limit == 0 {
        anyhow::bail!("chunking.chunk_token_limit must be > 0");
    }
    if config.chunking.chunk_char_limit == 0 {
        anyhow::bail!("chunking.chunk_char_limit must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.chunk_token_limit {
        anyhow::bail!("chunking.overlap_tokens must be < chunk_token_limit");
    }
    if config.chunking.token_char_ratio == 0 {
        anyhow::bail!("chunking.token_char_ratio must be > 0");
    }

    match config.embedding.provider.as_str() {
        "local" | "voyage" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local, voyage, or hash.",
            other
        ),
    }
    if config.embedding.provider == "voyage" && config.embedding.voyage_key().is_none() {
        anyhow::bail!("embedding.voyage_api_key (or VOYAGE_API_KEY) required for voyage provider");
    }

    if config.retrieval.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.decay_weight) {
        anyhow::bail!("retrieval.decay_weight must be in [0.0, 1.0]");
    }
    if config.ingest.log_roots.is_empty() {
        anyhow::bail!("ingest.log_roots must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/recall.toml")).unwrap();
        assert_eq!(config.chunking.chunk_token_limit, 400);
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.store.url, "http://localhost:6333");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[chunking]\nchunk_token_limit = 200").unwrap();
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.chunking.chunk_token_limit, 200);
        assert_eq!(config.chunking.chunk_char_limit, 1600);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[embedding]\nprovider = \"cohere\"").unwrap();
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_rejects_overlap_at_limit() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[chunking]\nchunk_token_limit = 100\noverlap_tokens = 100").unwrap();
        assert!(load_config(f.path()).is_err());
    }
}
