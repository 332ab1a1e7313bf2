//! Durable ingest state: per-transcript stream positions.
//!
//! A single JSON document keyed by absolute file path. Each value is
//! either the current object form (`byte_offset`, `last_mtime`, `chunks`,
//! optional skip marker) or a legacy ISO-8601 string left behind by older
//! deployments. Legacy entries are migrated in memory on load — offset 0,
//! so the file is re-read; idempotent point ids make the replay harmless —
//! and rewritten in the current form on the next commit.
//!
//! Persistence is atomic: serialize to a temporary file in the same
//! directory, fsync, then rename over the authoritative file. A reader
//! never observes a torn write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Resumable marker for one transcript file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamPosition {
    /// Byte offset of the next unread line. Always line-aligned.
    pub byte_offset: u64,
    /// mtime (seconds since epoch) observed at the last commit.
    pub last_mtime: f64,
    /// Chunks emitted so far; the next chunk_index continues from here.
    pub chunks: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StreamPosition {
    pub fn new(byte_offset: u64, last_mtime: f64, chunks: u32) -> Self {
        Self {
            byte_offset,
            last_mtime,
            chunks,
            skip: false,
            skip_reason: None,
        }
    }

    pub fn skipped(reason: &str, last_mtime: f64) -> Self {
        Self {
            byte_offset: 0,
            last_mtime,
            chunks: 0,
            skip: true,
            skip_reason: Some(reason.to_string()),
        }
    }
}

/// Accepted on read: current object form or legacy timestamp string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPosition {
    Current(StreamPosition),
    Legacy(String),
}

/// Process-wide ingest state, owned by the engine. No other component
/// writes the state file.
#[derive(Debug, Default)]
pub struct IngestState {
    positions: HashMap<PathBuf, StreamPosition>,
}

impl IngestState {
    /// Load from `path`, migrating legacy entries. A missing file yields
    /// an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read ingest state {}", path.display()))?;
        let raw: HashMap<PathBuf, RawPosition> =
            serde_json::from_str(&content).with_context(|| "parse ingest state")?;

        let mut positions = HashMap::with_capacity(raw.len());
        let mut migrated = 0usize;
        for (file, value) in raw {
            let position = match value {
                RawPosition::Current(p) => p,
                RawPosition::Legacy(ts) => {
                    migrated += 1;
                    let mtime = DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.timestamp() as f64)
                        .unwrap_or(0.0);
                    StreamPosition::new(0, mtime, 0)
                }
            };
            positions.insert(file, position);
        }
        if migrated > 0 {
            debug!(migrated, "migrated legacy ingest-state entries");
        }
        Ok(Self { positions })
    }

    pub fn get(&self, file: &Path) -> Option<&StreamPosition> {
        self.positions.get(file)
    }

    pub fn set(&mut self, file: PathBuf, position: StreamPosition) {
        self.positions.insert(file, position);
    }

    pub fn remove(&mut self, file: &Path) {
        self.positions.remove(file);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Files recorded as fully or partially ingested (not skipped).
    pub fn indexed_count(&self) -> usize {
        self.positions.values().filter(|p| !p.skip).count()
    }

    /// Atomically write the state document to `path`.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let json = serde_json::to_string_pretty(&self.positions)?;

        let tmp = tmp_path(path);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rename {} over {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
