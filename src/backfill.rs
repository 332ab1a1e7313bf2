//! Metadata back-fill over already-stored points.
//!
//! After a metadata-schema upgrade, historical points carry stale payload
//! fields. This pass re-reads each transcript, re-derives the v2 metadata
//! (tools, files, concepts, git changes), and overwrites just those payload
//! fields via `set_payload`. Vectors are never touched and nothing is
//! re-embedded — chunk ids are deterministic, so the derived chunk lines up
//! with the stored point by id alone.
//!
//! The pass keeps its own completion ledger next to the ingest state and
//! persists it after every file, so an interrupted run resumes where it
//! left off. Running it twice is a no-op.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::chunker::{chunk_messages, ChunkerConfig};
use crate::config::Config;
use crate::error::RecallError;
use crate::project::{collection_id, normalized_project_name};
use crate::store::VectorIndex;
use crate::transcript::{Message, ParseLimits, TranscriptReader};

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub points_updated: usize,
    pub points_missing: usize,
}

/// Run the back-fill across every transcript under the log roots.
///
/// `suffix` selects which provider's collections are updated (`_local` or
/// `_voyage`); the pass never creates collections or points.
pub async fn run_backfill(
    config: &Config,
    store: Arc<dyn VectorIndex>,
    suffix: &str,
) -> Result<BackfillReport> {
    let ledger_path = ledger_path(&config.ingest.state_file);
    let mut done = load_ledger(&ledger_path)?;
    let mut report = BackfillReport::default();

    for root in &config.ingest.log_roots {
        if !root.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().map_or(true, |e| e != "jsonl")
            {
                continue;
            }
            if done.contains(path) {
                report.files_skipped += 1;
                continue;
            }

            match backfill_file(config, store.as_ref(), suffix, path, &mut report).await {
                Ok(()) => {
                    done.insert(path.to_path_buf());
                    persist_ledger(&ledger_path, &done).await?;
                    report.files_processed += 1;
                }
                Err(e) => match e.downcast_ref::<RecallError>() {
                    Some(RecallError::FileGone(_)) => {
                        report.files_skipped += 1;
                    }
                    _ => {
                        warn!(path = %path.display(), error = %e, "backfill failed for file");
                    }
                },
            }
        }
    }

    info!(
        files = report.files_processed,
        updated = report.points_updated,
        missing = report.points_missing,
        "metadata backfill finished"
    );
    Ok(report)
}

async fn backfill_file(
    config: &Config,
    store: &dyn VectorIndex,
    suffix: &str,
    path: &Path,
    report: &mut BackfillReport,
) -> Result<()> {
    let limits = ParseLimits {
        max_tool_outputs: config.chunking.max_tool_outputs,
        max_tool_output_chars: config.chunking.max_tool_output_chars,
    };
    let mut reader = TranscriptReader::open(path, 0, limits).await?;
    let mut messages: Vec<Message> = Vec::new();
    while let Some((message, _)) = reader.next_message().await? {
        messages.push(message);
    }
    if messages.is_empty() {
        return Ok(());
    }

    let conversation_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    let project = normalized_project_name(
        &path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    let collection = collection_id(&project, suffix);

    if !store.collection_exists(&collection).await? {
        debug!(collection = %collection, "collection absent; nothing to backfill");
        return Ok(());
    }

    let chunker_cfg = ChunkerConfig {
        chunk_token_limit: config.chunking.chunk_token_limit,
        chunk_char_limit: config.chunking.chunk_char_limit,
        overlap_tokens: config.chunking.overlap_tokens,
        overlap_chars: config.chunking.overlap_chars,
        token_char_ratio: config.chunking.token_char_ratio,
        ..ChunkerConfig::default()
    };
    let chunks = chunk_messages(&messages, &conversation_id, &project, 0, &chunker_cfg);

    for chunk in &chunks {
        let fields = json!({
            "files_analyzed": chunk.files_analyzed,
            "files_edited": chunk.files_edited,
            "tools_used": chunk.tools_used,
            "concepts": chunk.concepts,
            "git_file_changes": chunk.git_file_changes,
            "total_chunks": chunk.total_chunks,
            "metadata_version": chunk.metadata_version,
        });
        match store.set_payload(&collection, chunk.chunk_id, fields).await {
            Ok(()) => report.points_updated += 1,
            Err(e) => {
                // Point may legitimately be absent (never ingested, or a
                // chunk-boundary shift after config changes).
                debug!(id = %chunk.chunk_id, error = %e, "backfill target missing");
                report.points_missing += 1;
            }
        }
    }
    Ok(())
}

// ======== Completion ledger ========

fn ledger_path(state_file: &Path) -> PathBuf {
    state_file.with_file_name("backfill-state.json")
}

fn load_ledger(path: &Path) -> Result<HashSet<PathBuf>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read backfill ledger {}", path.display()))?;
    Ok(serde_json::from_str(&content)?)
}

async fn persist_ledger(path: &Path, done: &HashSet<PathBuf>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_string(done)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_point_id;
    use crate::embedding::{Embedder, HashEmbedder};
    use crate::store::{MemoryStore, Point};
    use std::io::Write;

    fn record(role: &str, text: &str) -> String {
        serde_json::json!({
            "type": role,
            "timestamp": "2026-01-05T10:00:00Z",
            "message": {"role": role, "content": text}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_backfill_updates_metadata_without_touching_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ingest.log_roots = vec![dir.path().join("logs")];
        config.ingest.state_file = dir.path().join("state.json");

        let project_dir = dir.path().join("logs").join("demo");
        std::fs::create_dir_all(&project_dir).unwrap();
        let mut f = std::fs::File::create(project_dir.join("conv.jsonl")).unwrap();
        writeln!(f, "{}", record("user", "set up the docker pipeline")).unwrap();
        drop(f);

        // Pre-store the point the way v1 ingest would have: no metadata.
        let store = Arc::new(MemoryStore::new());
        let collection = collection_id("demo", "_local");
        store.ensure_collection(&collection, 384).await.unwrap();
        let embedder = HashEmbedder::default();
        let vector = embedder
            .embed_batch(&["user: set up the docker pipeline".to_string()])
            .await
            .unwrap()
            .remove(0);
        let id = chunk_point_id("conv", 0);
        store
            .upsert(
                &collection,
                vec![Point {
                    id,
                    vector: vector.clone(),
                    payload: serde_json::json!({"project": "demo", "metadata_version": 1}),
                }],
            )
            .await
            .unwrap();

        let report = run_backfill(&config, store.clone(), "_local").await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.points_updated, 1);

        let hits = store
            .search_one(&collection, &vector, 1, 0.0, &Default::default())
            .await
            .unwrap();
        assert_eq!(hits[0].payload["metadata_version"], 2);
        assert_eq!(hits[0].payload["concepts"][0], "docker");
        // Vector untouched: the identical query still scores ~1.0.
        assert!(hits[0].score > 0.999);
    }

    #[tokio::test]
    async fn test_backfill_resumable_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ingest.log_roots = vec![dir.path().join("logs")];
        config.ingest.state_file = dir.path().join("state.json");

        let project_dir = dir.path().join("logs").join("demo");
        std::fs::create_dir_all(&project_dir).unwrap();
        let mut f = std::fs::File::create(project_dir.join("conv.jsonl")).unwrap();
        writeln!(f, "{}", record("user", "hello")).unwrap();
        drop(f);

        let store = Arc::new(MemoryStore::new());
        let first = run_backfill(&config, store.clone(), "_local").await.unwrap();
        assert_eq!(first.files_processed, 1);

        // Second run finds the ledger and skips the file entirely.
        let second = run_backfill(&config, store, "_local").await.unwrap();
        assert_eq!(second.files_processed, 0);
        assert_eq!(second.files_skipped, 1);
    }
}
