//! Continuous ingestion engine.
//!
//! A single cooperative scheduler loop drives three activities:
//!
//! 1. **Scan** — enumerate `*.jsonl` transcripts under the log roots and
//!    enqueue anything new or grown, classified by temperature.
//! 2. **Process** — drain the queue one file at a time through
//!    parse → chunk → embed → upsert, in chunk order.
//! 3. **Persist** — commit the stream position atomically after every
//!    successfully processed file.
//!
//! The loop runs every 2 s while HOT work exists and every 60 s otherwise.
//! CPU-bound inference happens on the embedding provider's worker thread;
//! everything here suspends at I/O.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::chunker::{chunk_messages, Chunk, ChunkerConfig};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::RecallError;
use crate::project::{collection_id, normalized_project_name};
use crate::queue::{IngestQueue, QueueEntry, Temperature};
use crate::resources::ResourceGuard;
use crate::state::{IngestState, StreamPosition};
use crate::store::{Point, VectorIndex};
use crate::transcript::{Message, ParseLimits, TranscriptReader};

/// Chunks embedded and upserted per batch while draining one file.
const EMBED_BATCH: usize = 32;

/// Shared engine health, read by `status()`.
#[derive(Debug, Default, Clone)]
pub struct StatusSnapshot {
    pub indexed_files: usize,
    pub pending_files: usize,
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub store_degraded: bool,
    pub last_cycle_age_secs: u64,
}

/// Handle cloned into the RPC server for `status()` reporting.
#[derive(Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<StatusInner>>,
}

#[derive(Default)]
struct StatusInner {
    snapshot: StatusSnapshot,
    last_cycle: Option<Instant>,
}

impl StatusHandle {
    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.snapshot);
    }

    fn mark_cycle(&self) {
        self.inner.lock().unwrap().last_cycle = Some(Instant::now());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut snap = inner.snapshot.clone();
        snap.last_cycle_age_secs = inner
            .last_cycle
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(u64::MAX);
        snap
    }
}

pub struct IngestEngine {
    config: Config,
    store: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    state: IngestState,
    queue: IngestQueue,
    guard: ResourceGuard,
    status: StatusHandle,
    /// Consecutive failure counts per file.
    retries: HashMap<PathBuf, u32>,
    /// Files that kept failing; rescanned as COLD until they succeed.
    quarantined: HashSet<PathBuf>,
    /// Project of the most recently processed file, for queue affinity.
    current_project: Option<String>,
    cold_admitted_this_cycle: usize,
    in_hot_cadence: bool,
}

impl IngestEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let state = IngestState::load(&config.ingest.state_file)?;
        info!(
            files = state.len(),
            state_file = %config.ingest.state_file.display(),
            "loaded ingest state"
        );
        let queue = IngestQueue::new(config.ingest.max_queue);
        let mut guard = ResourceGuard::new();
        guard.set_baseline();
        Ok(Self {
            config,
            store,
            embedder,
            state,
            queue,
            guard,
            status: StatusHandle::default(),
            retries: HashMap::new(),
            quarantined: HashSet::new(),
            current_project: None,
            cold_admitted_this_cycle: 0,
            in_hot_cadence: false,
        })
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Files still queued for processing.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run until the shutdown signal flips. The in-flight file finishes
    /// its commit before the loop exits, so restart resumes cleanly.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            provider = self.embedder.name(),
            dims = self.embedder.dims(),
            roots = ?self.config.ingest.log_roots,
            "ingestion engine started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle(&shutdown).await;

            let sleep = self.cycle_sleep();
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.state
            .persist(&self.config.ingest.state_file)
            .await
            .context("persist state at shutdown")?;
        info!("ingestion engine stopped");
        Ok(())
    }

    /// One scan-and-drain pass. Public so the batch `import` command and
    /// the tests can drive the engine without the timer loop.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) {
        self.cold_admitted_this_cycle = 0;
        self.scan().await;
        self.queue.promote_stale(self.config.max_warm_wait());
        self.drain(shutdown).await;
        self.status.mark_cycle();

        let cpu = self.guard.sample_cpu();
        let memory_mb = self.guard.memory_mb();
        let indexed = self.state.indexed_count();
        let pending = self.queue.len();
        self.status.update(|s| {
            s.cpu_percent = cpu;
            s.memory_mb = memory_mb;
            s.indexed_files = indexed;
            s.pending_files = pending;
        });
    }

    fn cycle_sleep(&mut self) -> Duration {
        let hot = self.queue.has_hot();
        if hot != self.in_hot_cadence {
            self.in_hot_cadence = hot;
            if hot {
                info!("hot work queued; tightening loop cadence");
            } else {
                info!("no hot work; returning to normal cadence");
            }
        }
        if hot {
            Duration::from_secs(self.config.ingest.hot_check_interval_secs)
        } else {
            Duration::from_secs(self.config.ingest.import_frequency_secs)
        }
    }

    // ======== Scan ========

    async fn scan(&mut self) {
        let mut discovered = 0usize;
        for root in self.config.ingest.log_roots.clone() {
            if !root.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().map_or(true, |e| e != "jsonl") {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if self.consider(path, &meta) {
                    discovered += 1;
                }
                // Keep scans cooperative on large trees.
                tokio::task::yield_now().await;
            }
        }
        if discovered > 0 {
            debug!(discovered, queued = self.queue.len(), "scan enqueued files");
        }
    }

    /// Apply the resumption rules to one discovered file. Returns whether
    /// it was enqueued.
    fn consider(&mut self, path: &Path, meta: &std::fs::Metadata) -> bool {
        if self.queue.contains(path) {
            return false;
        }

        let size = meta.len();
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let mtime_epoch = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let age = mtime.elapsed().unwrap_or(Duration::ZERO);

        let resume_from = match self.state.get(path) {
            None => 0,
            Some(pos) => {
                let unchanged = (pos.last_mtime - mtime_epoch).abs() < 1e-6;
                if pos.skip && unchanged {
                    return false;
                }
                if pos.byte_offset > size {
                    // Truncated below the persisted offset; start over.
                    warn!(path = %path.display(), offset = pos.byte_offset, size,
                          "transcript truncated; resetting position");
                    0
                } else if pos.byte_offset == size && unchanged {
                    return false;
                } else {
                    pos.byte_offset
                }
            }
        };

        let mut temperature = Temperature::classify(
            age,
            self.config.hot_window(),
            self.config.warm_window(),
        );
        // Quarantined files stay at the back of the line until one attempt
        // succeeds, whatever their mtime says.
        if self.quarantined.contains(path) {
            temperature = Temperature::Cold;
        }
        if temperature == Temperature::Cold {
            if self.cold_admitted_this_cycle >= self.config.ingest.max_cold_per_cycle {
                return false;
            }
            self.cold_admitted_this_cycle += 1;
        }

        let project = normalized_project_name(&parent_str(path));
        let different_project = self
            .current_project
            .as_ref()
            .map_or(false, |current| current != &project);

        self.queue.push(QueueEntry {
            path: path.to_path_buf(),
            resume_from,
            mtime_epoch,
            temperature,
            age_minutes: age.as_secs() / 60,
            enqueued_at: Instant::now(),
            different_project,
        })
    }

    // ======== Process ========

    async fn drain(&mut self, shutdown: &watch::Receiver<bool>) {
        while let Some(entry) = self.queue.pop() {
            if *shutdown.borrow() {
                // Not processed; release the claim so the next run picks
                // it up again.
                self.queue.complete(&entry.path);
                break;
            }

            if self
                .guard
                .memory_exceeded(self.config.resources.operational_memory_limit_mb)
            {
                warn!(
                    over_mb = self.guard.memory_over_baseline_mb(),
                    "memory guard tripped; deferring file"
                );
                self.guard.release_memory();
                // Defer, don't drop: the entry goes back with its original
                // enqueue time and temperature, so its priority and
                // tie-break standing survive.
                self.queue.complete(&entry.path);
                self.queue.push(entry);
                break;
            }
            self.guard.sample_cpu();
            if self
                .guard
                .cpu_exceeded(self.config.resources.max_cpu_percent_per_core)
            {
                debug!("cpu guard tripped; sleeping one loop tick");
                self.queue.complete(&entry.path);
                self.queue.push(entry);
                // One short tick, then retry in place. The sliding average
                // decays while the engine idles, so this converges instead
                // of pushing the work out to the next full scan cycle.
                tokio::time::sleep(Duration::from_secs(
                    self.config.ingest.hot_check_interval_secs,
                ))
                .await;
                continue;
            }

            let path = entry.path.clone();
            match self.process_file(&entry).await {
                Ok(()) => {
                    self.retries.remove(&path);
                    self.quarantined.remove(&path);
                }
                Err(e) => self.handle_failure(&path, e),
            }
            self.queue.complete(&path);
            self.guard.release_memory();
        }
    }

    fn handle_failure(&mut self, path: &Path, e: anyhow::Error) {
        match e.downcast_ref::<RecallError>() {
            Some(RecallError::FileGone(_)) => {
                debug!(path = %path.display(), "transcript disappeared; dropping");
                self.queue.forget(path);
                self.state.remove(path);
                self.retries.remove(path);
                return;
            }
            Some(RecallError::FileTruncated { .. }) => {
                self.state
                    .set(path.to_path_buf(), StreamPosition::new(0, 0.0, 0));
                debug!(path = %path.display(), "reset stream position after truncation");
                return;
            }
            Some(err) if err.is_transient() => {
                if matches!(err, RecallError::StoreUnavailable { .. }) {
                    self.status.update(|s| s.store_degraded = true);
                }
            }
            _ => {}
        }

        let attempts = self.retries.entry(path.to_path_buf()).or_insert(0);
        *attempts += 1;
        warn!(path = %path.display(), attempts = *attempts, error = %e, "file processing failed");
        if *attempts >= self.config.ingest.max_file_retries {
            warn!(path = %path.display(), "quarantining file after repeated failures");
            self.quarantined.insert(path.to_path_buf());
            self.retries.remove(path);
        }
    }

    async fn process_file(&mut self, entry: &QueueEntry) -> Result<()> {
        let path = &entry.path;
        let limits = ParseLimits {
            max_tool_outputs: self.config.chunking.max_tool_outputs,
            max_tool_output_chars: self.config.chunking.max_tool_output_chars,
        };

        let mut reader = TranscriptReader::open(path, entry.resume_from, limits).await?;
        let mut messages: Vec<Message> = Vec::new();
        while let Some((message, _offset)) = reader.next_message().await? {
            messages.push(message);
        }
        let final_offset = reader.offset();

        if messages.is_empty() {
            let reason = if final_offset == 0 { "empty" } else { "summary_only" };
            debug!(path = %path.display(), reason, "nothing to index");
            self.state.set(
                path.clone(),
                StreamPosition::skipped(reason, entry.mtime_epoch),
            );
            self.state.persist(&self.config.ingest.state_file).await?;
            return Ok(());
        }

        let conversation_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let project = normalized_project_name(&parent_str(path));
        let collection =
            collection_id(&project, self.embedder.collection_suffix());

        let start_index = if entry.resume_from > 0 {
            self.state.get(path).map(|p| p.chunks).unwrap_or(0)
        } else {
            0
        };

        let chunker_cfg = ChunkerConfig {
            chunk_token_limit: self.config.chunking.chunk_token_limit,
            chunk_char_limit: self.config.chunking.chunk_char_limit,
            overlap_tokens: self.config.chunking.overlap_tokens,
            overlap_chars: self.config.chunking.overlap_chars,
            token_char_ratio: self.config.chunking.token_char_ratio,
            ..ChunkerConfig::default()
        };
        let chunks = chunk_messages(&messages, &conversation_id, &project, start_index, &chunker_cfg);
        let produced = chunks.len() as u32;

        self.store
            .ensure_collection(&collection, self.embedder.dims())
            .await?;
        self.commit_chunks(&collection, chunks).await?;

        self.state.set(
            path.clone(),
            StreamPosition::new(final_offset, entry.mtime_epoch, start_index + produced),
        );
        self.state.persist(&self.config.ingest.state_file).await?;
        self.status.update(|s| s.store_degraded = false);
        self.current_project = Some(project.clone());

        info!(
            path = %path.display(),
            project = %project,
            chunks = produced,
            offset = final_offset,
            "transcript committed"
        );
        Ok(())
    }

    /// Embed and upsert in `chunk_index` order; a later batch never
    /// commits before an earlier one.
    async fn commit_chunks(&self, collection: &str, chunks: Vec<Chunk>) -> Result<()> {
        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "embedding returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }
            let points: Vec<Point> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| Point {
                    id: chunk.chunk_id,
                    vector,
                    payload: serde_json::to_value(chunk).unwrap_or_default(),
                })
                .collect();
            self.store.upsert(collection, points).await?;
        }
        Ok(())
    }
}

fn parent_str(path: &Path) -> String {
    path.parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::MemoryStore;
    use std::io::Write;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.ingest.log_roots = vec![dir.join("logs")];
        config.ingest.state_file = dir.join("state.json");
        config.ingest.max_cold_per_cycle = 100;
        config.resources.operational_memory_limit_mb = 8_192;
        config.resources.max_cpu_percent_per_core = 10_000.0;
        config
    }

    fn write_transcript(dir: &Path, project: &str, name: &str, lines: &[String]) -> PathBuf {
        let project_dir = dir.join("logs").join(project);
        std::fs::create_dir_all(&project_dir).unwrap();
        let path = project_dir.join(format!("{name}.jsonl"));
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    fn record(role: &str, text: &str) -> String {
        serde_json::json!({
            "type": role,
            "timestamp": "2026-01-05T10:00:00Z",
            "message": {"role": role, "content": text}
        })
        .to_string()
    }

    async fn engine_with(dir: &Path) -> (IngestEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(HashEmbedder::default());
        let engine = IngestEngine::new(test_config(dir), store.clone(), embedder).unwrap();
        (engine, store)
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_cold_start_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write_transcript(
            dir.path(),
            "-home-u-demo",
            "abcd",
            &[record("user", "how do I dockerize this"), record("assistant", "start from a slim base image")],
        );

        let (mut engine, store) = engine_with(dir.path()).await;
        engine.run_cycle(&no_shutdown()).await;

        let collection = collection_id("demo", "_local");
        assert_eq!(store.count(&collection).await.unwrap(), 1);
        let hits = store
            .search_one(&collection, &[0.0; 384], 10, -1.0, &Default::default())
            .await
            .unwrap();
        assert_eq!(hits[0].payload["project"], "demo");
        assert_eq!(hits[0].payload["conversation_id"], "abcd");
        assert_eq!(hits[0].payload["chunk_index"], 0);
    }

    #[tokio::test]
    async fn test_state_records_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(
            dir.path(),
            "demo",
            "conv",
            &[record("user", "hello")],
        );
        let size = std::fs::metadata(&path).unwrap().len();

        let (mut engine, _store) = engine_with(dir.path()).await;
        engine.run_cycle(&no_shutdown()).await;

        let state = IngestState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.get(&path).unwrap().byte_offset, size);
    }

    #[tokio::test]
    async fn test_incremental_append_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(
            dir.path(),
            "demo",
            "conv",
            &[record("user", "first question")],
        );

        let (mut engine, store) = engine_with(dir.path()).await;
        engine.run_cycle(&no_shutdown()).await;
        let collection = collection_id("demo", "_local");
        let after_first = store.count(&collection).await.unwrap();

        // Append and bump mtime.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", record("assistant", "a considered answer")).unwrap();
        drop(f);

        engine.run_cycle(&no_shutdown()).await;
        let after_second = store.count(&collection).await.unwrap();
        assert!(after_second >= after_first);

        let state = IngestState::load(&dir.path().join("state.json")).unwrap();
        let pos = state.get(&path).unwrap();
        assert_eq!(pos.byte_offset, std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn test_empty_file_skipped_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(dir.path(), "demo", "empty", &[]);

        let (mut engine, store) = engine_with(dir.path()).await;
        engine.run_cycle(&no_shutdown()).await;

        let state = IngestState::load(&dir.path().join("state.json")).unwrap();
        let pos = state.get(&path).unwrap();
        assert!(pos.skip);
        assert_eq!(pos.skip_reason.as_deref(), Some("empty"));
        assert_eq!(pos.byte_offset, 0);
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_only_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let summary = serde_json::json!({
            "type": "summary",
            "message": {"content": "what happened"}
        })
        .to_string();
        let path = write_transcript(dir.path(), "demo", "sums", &[summary]);

        let (mut engine, _store) = engine_with(dir.path()).await;
        engine.run_cycle(&no_shutdown()).await;

        let state = IngestState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(
            state.get(&path).unwrap().skip_reason.as_deref(),
            Some("summary_only")
        );
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..30)
            .map(|i| record("user", &format!("question number {i} about the database schema")))
            .collect();
        write_transcript(dir.path(), "demo", "conv", &lines);

        let (mut engine, store) = engine_with(dir.path()).await;
        engine.run_cycle(&no_shutdown()).await;
        let collection = collection_id("demo", "_local");
        let first = store.count(&collection).await.unwrap();

        // Wipe the state file to simulate losing the position mid-crash;
        // replay must not duplicate points.
        std::fs::remove_file(dir.path().join("state.json")).unwrap();
        let store2 = store.clone();
        let embedder = Arc::new(HashEmbedder::default());
        let mut engine2 =
            IngestEngine::new(test_config(dir.path()), store2, embedder).unwrap();
        engine2.run_cycle(&no_shutdown()).await;

        assert_eq!(store.count(&collection).await.unwrap(), first);
        drop(engine);
    }

    #[tokio::test]
    async fn test_quarantine_after_repeated_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _store) = engine_with(dir.path()).await;

        let path = PathBuf::from("/logs/demo/broken.jsonl");
        for _ in 0..engine.config.ingest.max_file_retries {
            engine.handle_failure(&path, RecallError::Transient("boom".into()).into());
        }
        assert!(engine.quarantined.contains(&path));
        assert!(!engine.retries.contains_key(&path));
    }

    #[tokio::test]
    async fn test_file_gone_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _store) = engine_with(dir.path()).await;
        let path = PathBuf::from("/logs/demo/gone.jsonl");
        engine
            .state
            .set(path.clone(), StreamPosition::new(10, 1.0, 1));
        engine.handle_failure(&path, RecallError::FileGone(path.clone()).into());
        assert!(engine.state.get(&path).is_none());
    }
}
