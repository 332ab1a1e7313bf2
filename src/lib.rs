//! # Recall Harness
//!
//! **Continuous semantic recall over LLM assistant conversation logs.**
//!
//! Recall Harness tails the append-only `.jsonl` transcripts a coding
//! assistant writes, chunks and embeds them, stores the vectors in a
//! Qdrant-compatible store partitioned per project, and exposes a small
//! HTTP tool surface that lets an agent search its own past conversations
//! and store reflections.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌──────────┐
//! │ Transcripts │──▶│ Ingest Engine │──▶│  Qdrant  │
//! │  *.jsonl    │   │ parse→chunk→  │   │ per-proj │
//! └────────────┘   │ embed→upsert  │   │ colls    │
//!                  └───────────────┘   └────┬─────┘
//!                                           │
//!                          ┌────────────────┤
//!                          ▼                ▼
//!                    ┌──────────┐     ┌───────────┐
//!                    │   CLI    │     │ HTTP tool │
//!                    │ (recall) │     │  surface  │
//!                    └──────────┘     └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **ingestion engine** ([`engine`]) scans the log roots, classifies
//!    files by modification age (HOT/WARM/COLD), and drains a bounded
//!    priority queue ([`queue`]).
//! 2. The **transcript parser** ([`transcript`]) streams records from a
//!    resumable byte offset, folding content parts into normalized messages.
//! 3. The **chunker** ([`chunker`]) groups messages into token-bounded,
//!    overlapping chunks with derived metadata (files, tools, concepts).
//! 4. The **embedding provider** ([`embedding`]) turns chunk text into
//!    vectors — in-process ONNX on a dedicated worker thread, or the
//!    remote Voyage API with token-aware batching.
//! 5. The **store adapter** ([`store`]) upserts points into per-project
//!    collections named by the **path resolver** ([`project`]); stream
//!    positions persist atomically ([`state`]) so crashes replay cleanly.
//! 6. The **retrieval engine** ([`retrieval`]) fans a query out across
//!    collections, applies optional time-decay re-ranking, and formats
//!    results for the **HTTP surface** ([`server`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`project`] | Project name normalization and collection ids |
//! | [`transcript`] | Append-only `.jsonl` parser with resumable offsets |
//! | [`chunker`] | Token-bounded chunker with overlap and metadata |
//! | [`embedding`] | Embedding provider trait and implementations |
//! | [`store`] | Vector store trait, Qdrant adapter, in-memory store |
//! | [`state`] | Durable per-file stream positions (atomic persist) |
//! | [`queue`] | Temperature-classified bounded priority queue |
//! | [`resources`] | Memory and CPU guards (cgroup-aware) |
//! | [`engine`] | The continuous ingestion loop |
//! | [`backfill`] | Metadata-only repair pass over stored points |
//! | [`retrieval`] | Query fan-out, decay re-ranking, formatting |
//! | [`server`] | HTTP tool surface (Axum) |
//! | [`error`] | Shared error kinds and recovery policy |

pub mod backfill;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod project;
pub mod queue;
pub mod resources;
pub mod retrieval;
pub mod server;
pub mod state;
pub mod store;
pub mod transcript;
