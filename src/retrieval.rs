//! Retrieval engine: semantic search over past conversations.
//!
//! Three operations form the external contract:
//!
//! - [`RetrievalEngine::reflect_on_past`] — embed a query, fan out over
//!   the caller's candidate collections plus `reflections`, optionally
//!   re-rank by recency, and format the merged results.
//! - [`RetrievalEngine::store_reflection`] — persist a user-authored note
//!   into the well-known `reflections` collection.
//! - [`RetrievalEngine::get_full_conversation`] — return a transcript's
//!   raw content by conversation id, guarded against path traversal.
//!
//! The caller's project is resolved from a per-request working-directory
//! hint captured at the RPC boundary — never from the server's own cwd,
//! and always through the same name-normalization used at ingest. Using
//! anything else silently routes queries to empty collections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{embed_query, Embedder};
use crate::error::RecallError;
use crate::project::{collection_id, normalized_project_name, REFLECTIONS_COLLECTION};
use crate::store::{search_many, Point, ScoredPoint, SearchFilter, VectorIndex};

/// Overfetch factor per collection before the merged trim.
const OVERFETCH: f64 = 1.5;

/// Excerpt length in brief mode.
const BRIEF_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Structured,
    Markdown,
}

/// Arguments to [`RetrievalEngine::reflect_on_past`].
#[derive(Debug, Clone)]
pub struct ReflectRequest {
    pub query: String,
    pub limit: usize,
    pub min_score: f64,
    /// `None` = current project (from the cwd hint); `"all"` = every
    /// collection for the active provider; anything else = that project.
    pub project: Option<String>,
    /// `-1` = server default, `0` = off, `1` = on.
    pub use_decay: i8,
    pub brief: bool,
    pub response_format: ResponseFormat,
    pub include_raw: bool,
}

impl Default for ReflectRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: 5,
            min_score: 0.0,
            project: None,
            use_decay: -1,
            brief: false,
            response_format: ResponseFormat::Structured,
            include_raw: false,
        }
    }
}

/// Formatted search outcome.
#[derive(Debug)]
pub struct ReflectResponse {
    pub text: String,
    pub count: usize,
    /// `Some("no_collections")` when the resolved scope was empty.
    pub reason: Option<&'static str>,
}

pub struct RetrievalEngine {
    config: Config,
    store: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalEngine {
    pub fn new(config: Config, store: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            store,
            embedder,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.embedder.name()
    }

    pub async fn collection_count(&self) -> usize {
        self.store
            .list_collections()
            .await
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Search past conversations and reflections.
    pub async fn reflect_on_past(
        &self,
        request: &ReflectRequest,
        caller_cwd: Option<&str>,
    ) -> Result<ReflectResponse> {
        if request.query.trim().is_empty() {
            return Err(RecallError::InvalidArgument {
                field: "query".to_string(),
                message: "must not be empty".to_string(),
            }
            .into());
        }
        if request.limit == 0 {
            return Err(RecallError::InvalidArgument {
                field: "limit".to_string(),
                message: "must be >= 1".to_string(),
            }
            .into());
        }

        let started = Instant::now();
        let collections = self.resolve_collections(request.project.as_deref(), caller_cwd).await?;
        if collections.is_empty() {
            debug!("no collections in scope for query");
            return Ok(ReflectResponse {
                text: self.format_empty(request),
                count: 0,
                reason: Some("no_collections"),
            });
        }

        let vector = embed_query(self.embedder.as_ref(), &request.query).await?;
        let per_collection = ((request.limit as f64) * OVERFETCH).ceil() as usize;

        // min_score is applied inside the store, before any decay bonus;
        // decay re-ranks the survivors, it does not resurrect pruned hits.
        let mut hits = search_many(
            self.store.as_ref(),
            &collections,
            &vector,
            per_collection,
            usize::MAX,
            request.min_score,
            &SearchFilter::default(),
        )
        .await?;

        let decay = match request.use_decay {
            0 => false,
            1 => true,
            _ => self.config.retrieval.enable_memory_decay,
        };
        if decay {
            self.apply_decay(&mut hits);
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(request.limit);

        let elapsed_ms = started.elapsed().as_millis();
        let count = hits.len();
        let text = match request.response_format {
            ResponseFormat::Structured => {
                self.format_structured(request, &hits, decay, elapsed_ms)
            }
            ResponseFormat::Markdown => self.format_markdown(request, &hits, decay),
        };
        Ok(ReflectResponse {
            text,
            count,
            reason: None,
        })
    }

    /// Store a user-authored reflection; durable once this returns.
    pub async fn store_reflection(
        &self,
        content: &str,
        tags: &[String],
        caller_cwd: Option<&str>,
    ) -> Result<Uuid> {
        if content.trim().is_empty() {
            return Err(RecallError::InvalidArgument {
                field: "content".to_string(),
                message: "must not be empty".to_string(),
            }
            .into());
        }

        let vector = embed_query(self.embedder.as_ref(), content).await?;
        self.store
            .ensure_collection(REFLECTIONS_COLLECTION, self.embedder.dims())
            .await?;

        let project = caller_cwd.map(normalized_project_name);
        let id = Uuid::new_v4();
        let payload = serde_json::json!({
            "content": content,
            "tags": tags,
            "project": project,
            "stored_at": Utc::now().to_rfc3339(),
        });
        self.store
            .upsert(
                REFLECTIONS_COLLECTION,
                vec![Point {
                    id,
                    vector,
                    payload,
                }],
            )
            .await?;
        info!(id = %id, tags = ?tags, "reflection stored");
        Ok(id)
    }

    /// Return a transcript's full content by conversation id.
    pub async fn get_full_conversation(
        &self,
        conversation_id: &str,
        project: Option<&str>,
        caller_cwd: Option<&str>,
    ) -> Result<String> {
        // Traversal guard: the id must be a bare basename.
        if conversation_id.is_empty()
            || conversation_id.contains('/')
            || conversation_id.contains('\\')
            || conversation_id.contains("..")
        {
            return Err(RecallError::InvalidArgument {
                field: "conversation_id".to_string(),
                message: "must be a bare conversation id".to_string(),
            }
            .into());
        }

        let wanted_project = project
            .map(str::to_string)
            .or_else(|| caller_cwd.map(normalized_project_name))
            .map(|p| normalized_project_name(&p));

        let file_name = format!("{conversation_id}.jsonl");
        for root in &self.config.ingest.log_roots {
            if !root.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(root)
                .max_depth(2)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy() != file_name.as_str() {
                    continue;
                }
                if let Some(wanted) = &wanted_project {
                    let dir = entry
                        .path()
                        .parent()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if &normalized_project_name(&dir) != wanted {
                        continue;
                    }
                }
                return tokio::fs::read_to_string(entry.path())
                    .await
                    .map_err(Into::into);
            }
        }
        Err(RecallError::FileGone(PathBuf::from(file_name)).into())
    }

    // ======== Collection resolution ========

    async fn resolve_collections(
        &self,
        project: Option<&str>,
        caller_cwd: Option<&str>,
    ) -> Result<Vec<String>> {
        let existing = self.store.list_collections().await?;
        let suffix = self.embedder.collection_suffix();

        let mut wanted: Vec<String> = match project {
            Some("all") => existing
                .iter()
                .filter(|name| name.starts_with("conv_") && name.ends_with(suffix))
                .cloned()
                .collect(),
            Some(p) => vec![collection_id(&normalized_project_name(p), suffix)],
            None => match caller_cwd {
                Some(cwd) => vec![collection_id(&normalized_project_name(cwd), suffix)],
                // No hint at all: search everything rather than nothing.
                None => existing
                    .iter()
                    .filter(|name| name.starts_with("conv_") && name.ends_with(suffix))
                    .cloned()
                    .collect(),
            },
        };
        wanted.push(REFLECTIONS_COLLECTION.to_string());

        // Only fan out over collections that actually exist; reflections
        // are searched from any project scope.
        wanted.retain(|name| existing.iter().any(|e| e == name));
        wanted.dedup();
        Ok(wanted)
    }

    // ======== Decay re-ranking ========

    /// Add `w · exp(-Δt/τ)` to each hit with a parseable timestamp. All
    /// comparisons happen in UTC; payload timestamps are RFC 3339.
    fn apply_decay(&self, hits: &mut [ScoredPoint]) {
        let now = Utc::now();
        let tau = f64::from(self.config.retrieval.decay_scale_days) * 86_400.0;
        let weight = self.config.retrieval.decay_weight;
        for hit in hits {
            if let Some(ts) = point_timestamp(&hit.payload) {
                let age_secs = (now - ts).num_seconds().max(0) as f64;
                hit.score += weight * (-age_secs / tau).exp();
            }
        }
    }

    // ======== Formatting ========

    fn format_empty(&self, request: &ReflectRequest) -> String {
        match request.response_format {
            ResponseFormat::Structured => format!(
                "<recall q=\"{}\" n=\"0\" reason=\"no_collections\"/>",
                escape_attr(&request.query)
            ),
            ResponseFormat::Markdown => format!(
                "No indexed conversations found for this scope (query: {}).",
                request.query
            ),
        }
    }

    fn format_structured(
        &self,
        request: &ReflectRequest,
        hits: &[ScoredPoint],
        decay: bool,
        elapsed_ms: u128,
    ) -> String {
        let (lo, hi) = score_range(hits);
        let mut out = format!(
            "<recall q=\"{}\" n=\"{}\" lo=\"{:.3}\" hi=\"{:.3}\" e=\"{}\" d=\"{}\" ms=\"{}\">\n",
            escape_attr(&request.query),
            hits.len(),
            lo,
            hi,
            self.embedder.name(),
            if decay { 1 } else { 0 },
            elapsed_ms,
        );
        for hit in hits {
            let excerpt = excerpt_of(&hit.payload, request.brief);
            out.push_str(&format!(
                "<r s=\"{:.3}\" t=\"{}\" p=\"{}\" role=\"{}\"{}>{}</r>\n",
                hit.score,
                payload_str(&hit.payload, "timestamp")
                    .or_else(|| payload_str(&hit.payload, "stored_at"))
                    .unwrap_or_default(),
                payload_str(&hit.payload, "project").unwrap_or_default(),
                payload_str(&hit.payload, "start_role").unwrap_or_default(),
                payload_str(&hit.payload, "conversation_id")
                    .map(|c| format!(" c=\"{c}\""))
                    .unwrap_or_default(),
                escape_text(&excerpt),
            ));
        }
        if request.include_raw {
            for hit in hits {
                out.push_str(&format!(
                    "<raw id=\"{}\">{}</raw>\n",
                    hit.id,
                    escape_text(&hit.payload.to_string())
                ));
            }
        }
        out.push_str("</recall>");
        out
    }

    fn format_markdown(
        &self,
        request: &ReflectRequest,
        hits: &[ScoredPoint],
        decay: bool,
    ) -> String {
        let mut out = format!(
            "## Recall results\n\nQuery: {}\nResults: {} (decay {})\n\n",
            request.query,
            hits.len(),
            if decay { "on" } else { "off" },
        );
        for (i, hit) in hits.iter().enumerate() {
            let excerpt = excerpt_of(&hit.payload, request.brief);
            out.push_str(&format!(
                "### {}. score {:.3} — {} ({})\n\n{}\n\n",
                i + 1,
                hit.score,
                payload_str(&hit.payload, "project").unwrap_or_default(),
                payload_str(&hit.payload, "timestamp")
                    .or_else(|| payload_str(&hit.payload, "stored_at"))
                    .unwrap_or_default(),
                excerpt,
            ));
            if request.include_raw {
                out.push_str(&format!("```json\n{}\n```\n\n", hit.payload));
            }
        }
        out
    }
}

fn point_timestamp(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = payload
        .get("timestamp")
        .or_else(|| payload.get("stored_at"))?
        .as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn payload_str(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Chunks carry `text`, reflections carry `content`.
fn excerpt_of(payload: &serde_json::Value, brief: bool) -> String {
    let text = payload_str(payload, "text")
        .or_else(|| payload_str(payload, "content"))
        .unwrap_or_default();
    if brief && text.chars().count() > BRIEF_CHARS {
        let mut preview: String = text.chars().take(BRIEF_CHARS).collect();
        preview.push('…');
        preview
    } else {
        text
    }
}

fn score_range(hits: &[ScoredPoint]) -> (f64, f64) {
    if hits.is_empty() {
        return (0.0, 0.0);
    }
    hits.iter().fold((f64::MAX, f64::MIN), |(lo, hi), h| {
        (lo.min(h.score), hi.max(h.score))
    })
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;")
}
