//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **`LocalEmbedder`** — in-process ONNX inference via fastembed
//!   (384-dim), isolated on a dedicated worker thread.
//! - **[`VoyageEmbedder`]** — calls the Voyage embeddings API (1024-dim)
//!   with token-aware batching, retry, and backoff.
//! - **[`HashEmbedder`]** — deterministic offline fallback; no model, no
//!   network. Useful for tests and smoke runs.
//!
//! Callers hold an `Arc<dyn Embedder>` and never branch on the variant.
//!
//! # Worker-thread isolation
//!
//! The ONNX runtime retains arena buffers scoped to the thread that ran
//! inference. Run it inline on the async runtime and every executor thread
//! accumulates its own arenas until the process OOMs; pinned to one
//! long-lived worker thread, steady-state memory stays flat. Inference
//! requests cross to the worker over a channel and answers come back over
//! a oneshot. A semaphore of capacity 1 keeps the worker's queue shallow.
//!
//! # Retry strategy (remote)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 30 s doubling, capped at 120 s, up to 6 attempts

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::chunker::estimate_tokens;
use crate::config::EmbeddingConfig;
use crate::error::RecallError;
use crate::project::{SUFFIX_LOCAL, SUFFIX_VOYAGE};

/// Maximum recursive halvings of an over-budget batch before the remaining
/// text is truncated instead.
const MAX_SPLIT_DEPTH: u32 = 10;

/// Capability shared by all embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Produce one vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed vector dimensionality (384 local, 1024 remote).
    fn dims(&self) -> usize;

    /// Model identifier for logs and `status()`.
    fn name(&self) -> &str;

    /// Collection-id suffix partitioning the store by provider.
    fn collection_suffix(&self) -> &'static str;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let texts = [text.to_string()];
    let results = embedder.embed_batch(&texts).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Create the configured [`Embedder`].
///
/// When the local model fails to initialize and a Voyage key is configured,
/// falls back to the remote provider for this process lifetime (logged
/// prominently — the fallback changes vector dimensionality and therefore
/// which collections are read and written).
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "voyage" => Ok(Arc::new(VoyageEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::default())),
        #[cfg(feature = "local-embeddings")]
        "local" => match LocalEmbedder::init(config).await {
            Ok(local) => Ok(Arc::new(local)),
            Err(e) if config.voyage_key().is_some() => {
                warn!(error = %e, "local embedding init failed; falling back to voyage");
                Ok(Arc::new(VoyageEmbedder::new(config)?))
            }
            Err(e) => Err(e),
        },
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Local provider (fastembed on a worker thread) ============

#[cfg(feature = "local-embeddings")]
mod local {
    use super::*;
    use anyhow::Context;
    use std::path::PathBuf;
    use tracing::info;

    type Job = (Vec<String>, tokio::sync::oneshot::Sender<Result<Vec<Vec<f32>>>>);

    /// In-process ONNX embeddings, isolated on one dedicated worker thread.
    pub struct LocalEmbedder {
        tx: tokio::sync::mpsc::UnboundedSender<Job>,
        semaphore: Semaphore,
        model_name: String,
        dims: usize,
        timeout: Duration,
    }

    impl LocalEmbedder {
        /// Spawn the worker thread and wait for the model to load.
        ///
        /// Model files are downloaded into the cache directory on first
        /// use; a file lock serializes concurrent first-runs and stale
        /// `.lock` files from crashed runs are cleared beforehand. Fails
        /// with [`RecallError::EmbeddingInit`] if the model is not ready
        /// within `init_timeout_secs`.
        pub async fn init(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            let (fastembed_model, dims) = resolve_model(&model_name)?;

            let cache_dir = config
                .cache_dir
                .clone()
                .or_else(|| dirs::cache_dir().map(|d| d.join("recall-harness").join("models")))
                .unwrap_or_else(|| PathBuf::from("./models"));
            std::fs::create_dir_all(&cache_dir)
                .with_context(|| format!("create model cache dir {}", cache_dir.display()))?;
            clear_stale_locks(&cache_dir);

            // Cap the runtime's own thread pools before it initializes.
            std::env::set_var("OMP_NUM_THREADS", "1");
            std::env::set_var("TOKENIZERS_PARALLELISM", "false");

            let (init_tx, init_rx) = tokio::sync::oneshot::channel::<Result<()>>();
            let (job_tx, mut job_rx) = tokio::sync::mpsc::unbounded_channel::<Job>();

            let thread_cache = cache_dir.clone();
            std::thread::Builder::new()
                .name("recall-embed".to_string())
                .spawn(move || {
                    let model = {
                        let _guard = InitLock::acquire(&thread_cache);
                        fastembed::TextEmbedding::try_new(
                            fastembed::InitOptions::new(fastembed_model)
                                .with_cache_dir(thread_cache)
                                .with_show_download_progress(false),
                        )
                    };
                    let mut model = match model {
                        Ok(m) => {
                            let _ = init_tx.send(Ok(()));
                            m
                        }
                        Err(e) => {
                            let _ = init_tx.send(Err(anyhow::anyhow!(
                                "model initialization failed: {e}"
                            )));
                            return;
                        }
                    };
                    while let Some((texts, reply)) = job_rx.blocking_recv() {
                        let result = model
                            .embed(texts, None)
                            .map_err(|e| anyhow::anyhow!("local embedding failed: {e}"));
                        let _ = reply.send(result);
                    }
                })
                .context("spawn embedding worker thread")?;

            let init_timeout = Duration::from_secs(config.init_timeout_secs);
            match tokio::time::timeout(init_timeout, init_rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    return Err(RecallError::EmbeddingInit(e.to_string()).into());
                }
                Ok(Err(_)) => {
                    return Err(
                        RecallError::EmbeddingInit("worker thread exited".to_string()).into(),
                    );
                }
                Err(_) => {
                    return Err(RecallError::EmbeddingInit(format!(
                        "model not ready within {}s",
                        config.init_timeout_secs
                    ))
                    .into());
                }
            }

            info!(model = %model_name, dims, "local embedding model ready");
            Ok(Self {
                tx: job_tx,
                semaphore: Semaphore::new(1),
                model_name,
                dims,
                timeout: Duration::from_secs(config.timeout_secs),
            })
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let _permit = self.semaphore.acquire().await?;
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            self.tx
                .send((texts.to_vec(), reply_tx))
                .map_err(|_| anyhow::anyhow!("embedding worker thread is gone"))?;
            // Scale the deadline with batch size; a large batch on a small
            // CPU legitimately takes longer than one query embedding.
            let deadline = self.timeout * (1 + texts.len() as u32 / 32);
            match tokio::time::timeout(deadline, reply_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => bail!("embedding worker dropped the reply"),
                Err(_) => Err(RecallError::Transient(format!(
                    "local embedding timed out after {deadline:?}"
                ))
                .into()),
            }
        }

        fn dims(&self) -> usize {
            self.dims
        }

        fn name(&self) -> &str {
            &self.model_name
        }

        fn collection_suffix(&self) -> &'static str {
            SUFFIX_LOCAL
        }
    }

    fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
        match name {
            "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
            "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, bge-small-en-v1.5",
                other
            ),
        }
    }

    /// Exclusive lock on the model cache while downloading/loading.
    struct InitLock {
        file: Option<std::fs::File>,
    }

    impl InitLock {
        fn acquire(cache_dir: &std::path::Path) -> Self {
            use fs2::FileExt;
            let lock_path = cache_dir.join(".recall-init.lock");
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .ok();
            if let Some(f) = &file {
                if let Err(e) = f.lock_exclusive() {
                    warn!(error = %e, "could not lock model cache; proceeding unlocked");
                }
            }
            Self { file }
        }
    }

    impl Drop for InitLock {
        fn drop(&mut self) {
            use fs2::FileExt;
            if let Some(f) = self.file.take() {
                let _ = FileExt::unlock(&f);
            }
        }
    }

    /// Remove `.lock` leftovers from crashed downloads. Only files older
    /// than an hour are touched; a live download keeps its lock fresh.
    fn clear_stale_locks(cache_dir: &std::path::Path) {
        let Ok(entries) = std::fs::read_dir(cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "lock") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age > Duration::from_secs(3600));
            if stale {
                warn!(path = %path.display(), "removing stale model cache lock");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

// ============ Voyage provider (remote HTTP) ============

const VOYAGE_URL: &str = "https://api.voyageai.com/v1/embeddings";

/// Embedding provider using the Voyage API.
pub struct VoyageEmbedder {
    client: reqwest::Client,
    model: String,
    api_key: String,
    token_budget: usize,
    token_aware: bool,
    /// Character ratio matching the chunker's default estimate, so
    /// ingest-side and batch-side token counts agree.
    token_char_ratio: usize,
    max_retries: u32,
    semaphore: Semaphore,
}

impl VoyageEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .voyage_key()
            .ok_or_else(|| anyhow::anyhow!("voyage API key not configured"))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "voyage-3".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            api_key,
            token_budget: config.remote_token_budget,
            token_aware: config.use_token_aware_batching,
            token_char_ratio: 3,
            max_retries: config.max_retries,
            semaphore: Semaphore::new(2),
        })
    }

    fn batch_tokens(&self, texts: &[String]) -> usize {
        texts
            .iter()
            .map(|t| estimate_tokens(t, self.token_char_ratio))
            .sum()
    }

    /// Send a batch, splitting it in half while it exceeds the token
    /// budget. A single over-budget text is truncated at the character
    /// level rather than rejected — losing a tail beats losing the chunk.
    async fn embed_split(&self, texts: &[String], depth: u32) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if !self.token_aware || self.batch_tokens(texts) <= self.token_budget {
            return self.post_batch(texts).await;
        }

        if texts.len() == 1 || depth >= MAX_SPLIT_DEPTH {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                if estimate_tokens(text, self.token_char_ratio) > self.token_budget {
                    let keep = self.token_budget.saturating_mul(self.token_char_ratio) / 2;
                    let truncated: String = text.chars().take(keep.max(1)).collect();
                    warn!(
                        original_chars = text.chars().count(),
                        kept_chars = truncated.chars().count(),
                        splits = depth,
                        "text exceeds remote token budget; truncating"
                    );
                    out.extend(self.post_batch(std::slice::from_ref(&truncated)).await?);
                } else {
                    out.extend(self.post_batch(std::slice::from_ref(text)).await?);
                }
            }
            return Ok(out);
        }

        let mid = texts.len() / 2;
        let mut left = Box::pin(self.embed_split(&texts[..mid], depth + 1)).await?;
        let right = Box::pin(self.embed_split(&texts[mid..], depth + 1)).await?;
        left.extend(right);
        Ok(left)
    }

    async fn post_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 30s, 60s, then capped at 120s.
                let delay = Duration::from_secs((30u64 << (attempt - 1).min(2)).min(120));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(VOYAGE_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embeddings_response(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::Error::from(RecallError::Transient(format!(
                            "Voyage API error {status}: {body_text}"
                        ))));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Voyage API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(RecallError::Transient(e.to_string()).into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl Embedder for VoyageEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let _permit = self.semaphore.acquire().await?;
        self.embed_split(texts, 0).await
    }

    fn dims(&self) -> usize {
        1024
    }

    fn name(&self) -> &str {
        &self.model
    }

    fn collection_suffix(&self) -> &'static str {
        SUFFIX_VOYAGE
    }
}

/// Parse an OpenAI-shaped embeddings response (`data[].embedding`).
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Hash provider (deterministic fallback) ============

/// Deterministic embedding without a model: a hashed bag-of-words. Each
/// lowercased alphanumeric token is hashed into a bucket and counted, and
/// the counts are L2-normalized. Identical texts map to identical unit
/// vectors (cosine 1.0), texts sharing vocabulary correlate positively,
/// and disjoint texts score 0 — enough signal for offline tests and smoke
/// runs without a model download.
pub struct HashEmbedder {
    dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 384 }
    }
}

impl HashEmbedder {
    pub fn with_dims(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            // FNV-1a over the lowercased token picks the bucket.
            let mut hash: u64 = 0xcbf29ce484222325;
            for c in token.chars().flat_map(char::to_lowercase) {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    hash ^= u64::from(*b);
                    hash = hash.wrapping_mul(0x100000001b3);
                }
            }
            v[(hash % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|f| f * f).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for f in &mut v {
                *f /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "hash"
    }

    fn collection_suffix(&self) -> &'static str {
        SUFFIX_LOCAL
    }
}
