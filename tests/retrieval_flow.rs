//! End-to-end retrieval scenarios: ingest with the real engine, then
//! query through the retrieval engine, all against the in-memory store.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use recall_harness::config::Config;
use recall_harness::embedding::{Embedder, HashEmbedder};
use recall_harness::engine::IngestEngine;
use recall_harness::retrieval::{ReflectRequest, ResponseFormat, RetrievalEngine};
use recall_harness::store::MemoryStore;
use tokio::sync::watch;

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.ingest.log_roots = vec![dir.join("logs")];
    config.ingest.state_file = dir.join("state.json");
    config.ingest.max_cold_per_cycle = 1_000;
    config.resources.operational_memory_limit_mb = 8_192;
    config.resources.max_cpu_percent_per_core = 10_000.0;
    config
}

fn record(role: &str, text: &str) -> String {
    serde_json::json!({
        "type": role,
        "timestamp": "2026-01-05T10:00:00Z",
        "message": {"role": role, "content": text}
    })
    .to_string()
}

fn write_transcript(dir: &Path, project: &str, name: &str, lines: &[String]) {
    let project_dir = dir.join("logs").join(project);
    std::fs::create_dir_all(&project_dir).unwrap();
    let mut f = std::fs::File::create(project_dir.join(format!("{name}.jsonl"))).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
}

fn no_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

async fn ingest_and_engine(dir: &Path) -> (RetrievalEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let config = test_config(dir);
    let mut engine = IngestEngine::new(config.clone(), store.clone(), embedder.clone()).unwrap();
    engine.run_cycle(&no_shutdown()).await;
    (
        RetrievalEngine::new(config, store.clone(), embedder),
        store,
    )
}

/// store_reflection then reflect_on_past returns the same content with a
/// near-perfect score under the deterministic provider.
#[tokio::test]
async fn reflection_store_then_search_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _store) = ingest_and_engine(dir.path()).await;

    let content = "always run the smoke tests before tagging a release";
    let id = engine
        .store_reflection(content, &["process".to_string()], Some("/home/u/demo"))
        .await
        .unwrap();
    assert!(!id.is_nil());

    let request = ReflectRequest {
        query: content.to_string(),
        limit: 1,
        min_score: 0.9,
        response_format: ResponseFormat::Markdown,
        ..ReflectRequest::default()
    };
    let response = engine
        .reflect_on_past(&request, Some("/home/u/demo"))
        .await
        .unwrap();
    assert_eq!(response.count, 1);
    assert!(response.text.contains("smoke tests"));
}

/// Project-scoped search returns only that project's chunks, while
/// reflections remain visible from any scope.
#[tokio::test]
async fn project_scoping_with_reflections() {
    let dir = tempfile::tempdir().unwrap();
    write_transcript(
        dir.path(),
        "-home-u-alpha",
        "conv-a",
        &[record("user", "the alpha service keeps dropping websocket connections")],
    );
    write_transcript(
        dir.path(),
        "-home-u-beta",
        "conv-b",
        &[record("user", "the beta service keeps dropping websocket connections")],
    );

    let (engine, _store) = ingest_and_engine(dir.path()).await;
    engine
        .store_reflection(
            "websocket drops were the load balancer idle timeout",
            &[],
            Some("/home/u/alpha"),
        )
        .await
        .unwrap();

    let request = ReflectRequest {
        query: "the alpha service keeps dropping websocket connections".to_string(),
        limit: 10,
        project: Some("alpha".to_string()),
        response_format: ResponseFormat::Markdown,
        ..ReflectRequest::default()
    };
    let response = engine.reflect_on_past(&request, None).await.unwrap();

    assert!(response.text.contains("alpha service"));
    assert!(!response.text.contains("beta service"));
    // The reflection is included even though it lives outside the
    // project's own collection.
    assert!(response.text.contains("load balancer"));
}

/// The cwd hint routes an unscoped query to the caller's project through
/// the same normalization used at ingest.
#[tokio::test]
async fn cwd_hint_resolves_to_ingested_collection() {
    let dir = tempfile::tempdir().unwrap();
    write_transcript(
        dir.path(),
        "-home-u-gadget",
        "conv",
        &[record("user", "notes about the gadget build cache")],
    );

    let (engine, _store) = ingest_and_engine(dir.path()).await;

    let request = ReflectRequest {
        query: "notes about the gadget build cache".to_string(),
        limit: 5,
        response_format: ResponseFormat::Markdown,
        ..ReflectRequest::default()
    };
    // The caller's checkout lives at a different physical path than the
    // encoded log directory; the normalized name must still line up.
    let response = engine
        .reflect_on_past(&request, Some("/Users/someone/src/gadget"))
        .await
        .unwrap();
    assert_eq!(response.count, 1);
    assert!(response.text.contains("build cache"));
}

/// get_full_conversation returns the transcript verbatim and refuses
/// traversal outside the log roots.
#[tokio::test]
async fn full_conversation_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let lines = vec![
        record("user", "first line"),
        record("assistant", "second line"),
    ];
    write_transcript(dir.path(), "-home-u-demo", "abcd", &lines);

    let (engine, _store) = ingest_and_engine(dir.path()).await;

    let content = engine
        .get_full_conversation("abcd", Some("demo"), None)
        .await
        .unwrap();
    assert!(content.contains("first line"));
    assert!(content.contains("second line"));
    assert_eq!(content.lines().count(), 2);

    assert!(engine
        .get_full_conversation("../abcd", Some("demo"), None)
        .await
        .is_err());
    assert!(engine
        .get_full_conversation("missing", Some("demo"), None)
        .await
        .is_err());
}

/// Structured mode carries metadata attributes and short result tags.
#[tokio::test]
async fn structured_format_shape() {
    let dir = tempfile::tempdir().unwrap();
    write_transcript(
        dir.path(),
        "demo",
        "conv",
        &[record("user", "how should the retry budget be tuned")],
    );

    let (engine, _store) = ingest_and_engine(dir.path()).await;
    let request = ReflectRequest {
        query: "how should the retry budget be tuned".to_string(),
        limit: 3,
        project: Some("demo".to_string()),
        include_raw: true,
        ..ReflectRequest::default()
    };
    let response = engine.reflect_on_past(&request, None).await.unwrap();

    assert!(response.text.starts_with("<recall "));
    assert!(response.text.contains("n=\"1\""));
    assert!(response.text.contains("e=\"hash\""));
    assert!(response.text.contains("<r s=\""));
    assert!(response.text.contains("c=\"conv\""));
    assert!(response.text.contains("<raw id=\""));
    assert!(response.text.trim_end().ends_with("</recall>"));
}

/// Brief mode truncates excerpts to a short preview.
#[tokio::test]
async fn brief_mode_truncates_excerpts() {
    let dir = tempfile::tempdir().unwrap();
    let long = "an intentionally verbose explanation ".repeat(20);
    write_transcript(dir.path(), "demo", "conv", &[record("user", &long)]);

    let (engine, _store) = ingest_and_engine(dir.path()).await;
    let request = ReflectRequest {
        query: long.clone(),
        limit: 1,
        project: Some("demo".to_string()),
        brief: true,
        response_format: ResponseFormat::Markdown,
        ..ReflectRequest::default()
    };
    let response = engine.reflect_on_past(&request, None).await.unwrap();
    assert!(response.text.contains('…'));
    assert!(response.text.len() < long.len());
}
