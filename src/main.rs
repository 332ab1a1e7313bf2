//! # Recall Harness
//!
//! Continuous semantic recall over LLM assistant conversation logs.
//!
//! Subcommands:
//! - `serve` — run the ingestion engine and HTTP tool surface
//! - `import` — one-shot batch ingest of everything under the log roots
//! - `search` — query past conversations from the command line
//! - `status` — summarize ingest progress and store contents
//! - `backfill` — refresh payload metadata on already-stored points

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use recall_harness::backfill;
use recall_harness::config;
use recall_harness::embedding::create_embedder;
use recall_harness::engine::IngestEngine;
use recall_harness::retrieval::{ReflectRequest, ResponseFormat, RetrievalEngine};
use recall_harness::server;
use recall_harness::state::IngestState;
use recall_harness::store::{QdrantStore, VectorIndex};

#[derive(Parser)]
#[command(
    name = "recall",
    about = "Recall Harness — semantic recall over assistant conversation logs",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion engine and the HTTP tool surface
    Serve,

    /// Ingest everything under the log roots once, then exit
    Import {
        /// Maximum scan/drain cycles before giving up
        #[arg(long, default_value_t = 16)]
        max_cycles: usize,
    },

    /// Search indexed conversations
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Project scope (name, path, or "all"); defaults to the cwd
        #[arg(long)]
        project: Option<String>,

        /// Minimum similarity score in [0.0, 1.0]
        #[arg(long, default_value_t = 0.0)]
        min_score: f64,

        /// Force recency re-ranking on or off (default: server setting)
        #[arg(long)]
        decay: Option<bool>,
    },

    /// Show ingest progress and store contents
    Status,

    /// Refresh payload metadata on already-stored points
    Backfill,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let store: Arc<dyn VectorIndex> = Arc::new(QdrantStore::new(
        &cfg.store.url,
        Duration::from_secs(cfg.store.timeout_secs),
    )?);

    match cli.command {
        Commands::Serve => {
            let embedder = create_embedder(&cfg.embedding).await?;
            let mut engine = IngestEngine::new(cfg.clone(), store.clone(), embedder.clone())?;
            let status = engine.status_handle();
            let retrieval = Arc::new(RetrievalEngine::new(
                cfg.clone(),
                store.clone(),
                embedder.clone(),
            ));

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    let _ = shutdown_tx.send(true);
                }
            });

            let bind = cfg.server.bind.clone();
            tokio::select! {
                result = engine.run(shutdown_rx) => result?,
                result = server::run_server(&bind, retrieval, status) => result?,
            }
        }

        Commands::Import { max_cycles } => {
            let mut cfg = cfg;
            // Batch mode: no reason to trickle cold files.
            cfg.ingest.max_cold_per_cycle = usize::MAX;
            let embedder = create_embedder(&cfg.embedding).await?;
            let mut engine = IngestEngine::new(cfg, store, embedder)?;
            let (_tx, shutdown_rx) = watch::channel(false);
            for _ in 0..max_cycles {
                engine.run_cycle(&shutdown_rx).await;
                if engine.pending() == 0 {
                    break;
                }
            }
            let snapshot = engine.status_handle().snapshot();
            println!("import complete");
            println!("  indexed files: {}", snapshot.indexed_files);
            println!("  pending files: {}", snapshot.pending_files);
        }

        Commands::Search {
            query,
            limit,
            project,
            min_score,
            decay,
        } => {
            let embedder = create_embedder(&cfg.embedding).await?;
            let retrieval = RetrievalEngine::new(cfg, store, embedder);
            let request = ReflectRequest {
                query,
                limit,
                min_score,
                project,
                use_decay: match decay {
                    Some(true) => 1,
                    Some(false) => 0,
                    None => -1,
                },
                response_format: ResponseFormat::Markdown,
                ..ReflectRequest::default()
            };
            let cwd = std::env::current_dir()
                .ok()
                .map(|p| p.to_string_lossy().into_owned());
            let response = retrieval.reflect_on_past(&request, cwd.as_deref()).await?;
            println!("{}", response.text);
        }

        Commands::Status => {
            let state = IngestState::load(&cfg.ingest.state_file)?;
            let collections = store.list_collections().await.unwrap_or_default();
            println!("Recall Harness — Status");
            println!("=======================");
            println!();
            println!("  State file:   {}", cfg.ingest.state_file.display());
            println!("  Known files:  {}", state.len());
            println!("  Indexed:      {}", state.indexed_count());
            println!("  Store:        {}", cfg.store.url);
            println!("  Collections:  {}", collections.len());
            for name in &collections {
                let count = store.count(name).await.unwrap_or(0);
                println!("    {:<28} {:>8} points", name, count);
            }
        }

        Commands::Backfill => {
            let embedder = create_embedder(&cfg.embedding).await?;
            let report =
                backfill::run_backfill(&cfg, store, embedder.collection_suffix()).await?;
            println!("backfill complete");
            println!("  files processed: {}", report.files_processed);
            println!("  files skipped:   {}", report.files_skipped);
            println!("  points updated:  {}", report.points_updated);
            println!("  points missing:  {}", report.points_missing);
        }
    }

    Ok(())
}
