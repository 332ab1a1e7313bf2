//! Vector store abstraction and the Qdrant-compatible adapter.
//!
//! The [`VectorIndex`] trait defines the storage operations the pipeline
//! needs, enabling pluggable backends: the production [`QdrantStore`]
//! (REST over HTTP) and the in-memory [`MemoryStore`] used by tests.
//!
//! Collections are created lazily, one per (project, provider), plus the
//! well-known `reflections` collection. The engine never deletes a
//! collection and never updates a vector in place; the only mutation after
//! upsert is [`set_payload`](VectorIndex::set_payload), which the metadata
//! back-fill job uses to refresh payload fields without re-embedding.
//!
//! # Existence cache
//!
//! Collection existence is cached for five minutes to keep the upsert hot
//! path to one round-trip. The cache is advisory only — the authoritative
//! answer always comes from the store, and any error on a cached
//! collection evicts the entry so the next call re-verifies.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RecallError;

/// How long a verified collection name stays in the advisory cache.
const COLLECTION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Per-collection fan-out cap for multi-collection search.
const SEARCH_CONCURRENCY: usize = 8;

/// What the store persists: id, vector, and the chunk payload verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A search hit with its originating collection.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub collection: String,
    pub id: String,
    pub score: f64,
    pub payload: serde_json::Value,
}

/// Payload filter applied server-side during search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict hits to points whose payload `project` equals this value.
    pub project: Option<String>,
}

/// Abstract vector storage backend.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create `name` with the given dimensionality if it does not exist.
    /// Idempotent, including against creation races.
    async fn ensure_collection(&self, name: &str, dims: usize) -> Result<()>;

    /// Insert or overwrite points by id. Callers do not require
    /// read-your-writes within a batch.
    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<()>;

    /// Nearest-neighbor search in one collection.
    async fn search_one(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>>;

    /// Overwrite payload fields of one point, preserving its vector.
    async fn set_payload(
        &self,
        collection: &str,
        id: Uuid,
        fields: serde_json::Value,
    ) -> Result<()>;

    /// All collection names currently in the store.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Point count of one collection.
    async fn count(&self, collection: &str) -> Result<u64>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;
}

/// Search several collections concurrently (bounded fan-out), merge by
/// score descending, and trim to `limit`.
///
/// A failed search against one collection is logged and omitted; the call
/// fails only when every collection fails.
pub async fn search_many(
    store: &dyn VectorIndex,
    collections: &[String],
    vector: &[f32],
    per_collection_limit: usize,
    limit: usize,
    min_score: f64,
    filter: &SearchFilter,
) -> Result<Vec<ScoredPoint>> {
    if collections.is_empty() {
        return Ok(Vec::new());
    }

    let mut pending = collections.iter();
    let mut in_flight = FuturesUnordered::new();
    let mut merged: Vec<ScoredPoint> = Vec::new();
    let mut failures = 0usize;

    loop {
        while in_flight.len() < SEARCH_CONCURRENCY {
            match pending.next() {
                Some(name) => in_flight.push(async move {
                    (
                        name.clone(),
                        store
                            .search_one(name, vector, per_collection_limit, min_score, filter)
                            .await,
                    )
                }),
                None => break,
            }
        }
        match in_flight.next().await {
            Some((_, Ok(points))) => merged.extend(points),
            Some((name, Err(e))) => {
                warn!(collection = %name, error = %e, "collection search failed; omitting");
                failures += 1;
            }
            None => break,
        }
    }

    if failures == collections.len() {
        bail!("search failed in all {} collections", failures);
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    Ok(merged)
}

// ============ Qdrant adapter ============

/// Qdrant REST adapter.
pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<String, Instant>>,
}

impl QdrantStore {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> anyhow::Error {
        if e.is_connect() {
            RecallError::StoreUnavailable {
                url: self.base_url.clone(),
                message: e.to_string(),
            }
            .into()
        } else if e.is_timeout() {
            RecallError::Transient(format!("store request timed out: {e}")).into()
        } else {
            e.into()
        }
    }

    async fn cached(&self, name: &str) -> bool {
        let cache = self.cache.read().await;
        cache
            .get(name)
            .is_some_and(|seen| seen.elapsed() < COLLECTION_CACHE_TTL)
    }

    async fn remember(&self, name: &str) {
        self.cache.write().await.insert(name.to_string(), Instant::now());
    }

    async fn forget(&self, name: &str) {
        self.cache.write().await.remove(name);
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn ensure_collection(&self, name: &str, dims: usize) -> Result<()> {
        if self.cached(name).await {
            return Ok(());
        }

        // The cache is advisory; ask the store before creating.
        if self.collection_exists(name).await? {
            self.remember(name).await;
            return Ok(());
        }

        let body = serde_json::json!({
            "vectors": { "size": dims, "distance": "Cosine" }
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{name}")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if status.is_success() {
            debug!(collection = name, dims, "created collection");
            self.remember(name).await;
            return Ok(());
        }

        // Lost a creation race: another writer got there first.
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 409 || text.contains("already exists") {
            self.remember(name).await;
            return Ok(());
        }
        bail!("create collection {name} failed ({status}): {text}");
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<()> {
        let body = serde_json::json!({ "points": points });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{collection}/points?wait=false")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        self.forget(collection).await;
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RecallError::Transient(format!(
                "upsert into {collection} failed ({status}): {text}"
            ))
            .into());
        }
        bail!("upsert into {collection} failed ({status}): {text}");
    }

    async fn search_one(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if min_score > 0.0 {
            body["score_threshold"] = serde_json::json!(min_score);
        }
        if let Some(project) = &filter.project {
            body["filter"] = serde_json::json!({
                "must": [{ "key": "project", "match": { "value": project } }]
            });
        }

        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            self.forget(collection).await;
            let text = resp.text().await.unwrap_or_default();
            bail!("search in {collection} failed ({status}): {text}");
        }

        let json: serde_json::Value = resp.json().await?;
        let hits = json
            .get("result")
            .and_then(|r| r.as_array())
            .context("search response missing result array")?;

        Ok(hits
            .iter()
            .map(|hit| ScoredPoint {
                collection: collection.to_string(),
                id: hit
                    .get("id")
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_default(),
                score: hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                payload: hit.get("payload").cloned().unwrap_or(serde_json::json!({})),
            })
            .collect())
    }

    async fn set_payload(
        &self,
        collection: &str,
        id: Uuid,
        fields: serde_json::Value,
    ) -> Result<()> {
        let body = serde_json::json!({
            "payload": fields,
            "points": [id],
        });
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/payload")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("set_payload in {collection} failed ({status}): {text}");
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/collections"))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let json: serde_json::Value = resp.json().await?;
        Ok(json
            .pointer("/result/collections")
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| c.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{collection}")))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if !resp.status().is_success() {
            return Ok(0);
        }
        let json: serde_json::Value = resp.json().await?;
        Ok(json
            .pointer("/result/points_count")
            .and_then(|c| c.as_u64())
            .unwrap_or(0))
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Ok(resp.status().is_success())
    }
}

// ============ In-memory store (tests) ============

/// In-memory [`VectorIndex`] with brute-force cosine search. Behaviorally
/// aligned with the Qdrant adapter where the pipeline can tell the
/// difference: idempotent upsert by id, payload project filtering, score
/// thresholding, payload merge on `set_payload`.
#[derive(Default)]
pub struct MemoryStore {
    collections: std::sync::RwLock<HashMap<String, MemoryCollection>>,
}

#[derive(Default)]
struct MemoryCollection {
    dims: usize,
    points: HashMap<Uuid, Point>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    async fn ensure_collection(&self, name: &str, dims: usize) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        collections
            .entry(name.to_string())
            .or_insert_with(|| MemoryCollection {
                dims,
                points: HashMap::new(),
            });
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow::anyhow!("collection {collection} does not exist"))?;
        for point in points {
            if coll.dims != 0 && point.vector.len() != coll.dims {
                bail!(
                    "vector dims {} do not match collection {} ({})",
                    point.vector.len(),
                    collection,
                    coll.dims
                );
            }
            coll.points.insert(point.id, point);
        }
        Ok(())
    }

    async fn search_one(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().unwrap();
        let coll = collections
            .get(collection)
            .ok_or_else(|| anyhow::anyhow!("collection {collection} does not exist"))?;

        let mut hits: Vec<ScoredPoint> = coll
            .points
            .values()
            .filter(|p| match &filter.project {
                Some(project) => p
                    .payload
                    .get("project")
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| v == project),
                None => true,
            })
            .map(|p| ScoredPoint {
                collection: collection.to_string(),
                id: p.id.to_string(),
                score: f64::from(cosine_sim(vector, &p.vector)),
                payload: p.payload.clone(),
            })
            .filter(|sp| sp.score >= min_score)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn set_payload(
        &self,
        collection: &str,
        id: Uuid,
        fields: serde_json::Value,
    ) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow::anyhow!("collection {collection} does not exist"))?;
        let point = coll
            .points
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("point {id} not found in {collection}"))?;
        if let (Some(payload), Some(new_fields)) =
            (point.payload.as_object_mut(), fields.as_object())
        {
            for (k, v) in new_fields {
                payload.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap();
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| c.points.len() as u64)
            .unwrap_or(0))
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.read().unwrap().contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: u128, vector: Vec<f32>, project: &str) -> Point {
        Point {
            id: Uuid::from_u128(id),
            vector,
            payload: serde_json::json!({ "project": project }),
        }
    }

    #[tokio::test]
    async fn test_upsert_idempotent_by_id() {
        let store = MemoryStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert("c", vec![point(1, vec![1.0, 0.0], "a")])
            .await
            .unwrap();
        store
            .upsert("c", vec![point(1, vec![1.0, 0.0], "a")])
            .await
            .unwrap();
        assert_eq!(store.count("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_filters_by_project() {
        let store = MemoryStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point(1, vec![1.0, 0.0], "alpha"),
                    point(2, vec![1.0, 0.0], "beta"),
                ],
            )
            .await
            .unwrap();
        let filter = SearchFilter {
            project: Some("alpha".to_string()),
        };
        let hits = store
            .search_one("c", &[1.0, 0.0], 10, 0.0, &filter)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload["project"], "alpha");
    }

    #[tokio::test]
    async fn test_min_score_threshold() {
        let store = MemoryStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point(1, vec![1.0, 0.0], "a"),
                    point(2, vec![0.0, 1.0], "a"),
                ],
            )
            .await
            .unwrap();
        let hits = store
            .search_one("c", &[1.0, 0.0], 10, 0.5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_set_payload_merges_preserving_vector() {
        let store = MemoryStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert("c", vec![point(1, vec![0.6, 0.8], "a")])
            .await
            .unwrap();
        store
            .set_payload(
                "c",
                Uuid::from_u128(1),
                serde_json::json!({ "concepts": ["docker"] }),
            )
            .await
            .unwrap();
        let hits = store
            .search_one("c", &[0.6, 0.8], 1, 0.0, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].payload["project"], "a");
        assert_eq!(hits[0].payload["concepts"][0], "docker");
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_search_many_merges_and_tolerates_failures() {
        let store = MemoryStore::new();
        store.ensure_collection("a", 2).await.unwrap();
        store.ensure_collection("b", 2).await.unwrap();
        store
            .upsert("a", vec![point(1, vec![1.0, 0.0], "p")])
            .await
            .unwrap();
        store
            .upsert("b", vec![point(2, vec![0.9, 0.1], "p")])
            .await
            .unwrap();

        // "missing" does not exist and must be omitted, not fatal.
        let collections = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        let hits = search_many(
            &store,
            &collections,
            &[1.0, 0.0],
            10,
            10,
            0.0,
            &SearchFilter::default(),
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_search_many_fails_when_all_fail() {
        let store = MemoryStore::new();
        let collections = vec!["x".to_string(), "y".to_string()];
        let result = search_many(
            &store,
            &collections,
            &[1.0, 0.0],
            10,
            10,
            0.0,
            &SearchFilter::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
