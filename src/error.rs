//! Error kinds shared across the ingestion and retrieval pipeline.
//!
//! The taxonomy mirrors the recovery policy: transient kinds are retried
//! with backoff and the file re-queued, `FileGone`/`FileTruncated` adjust
//! queue and stream-position state, and everything else propagates as
//! `anyhow` context at the boundary that observed it. RPC surfaces expose
//! only the kind plus a short message; full detail goes to the logs.

use std::path::PathBuf;

/// Typed failures raised by the transcript parser and store adapter.
#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    /// The file disappeared between scan and read. Dropped from the queue
    /// without surfacing an error.
    #[error("transcript gone: {0}")]
    FileGone(PathBuf),

    /// The file is smaller than the persisted resume offset. The caller
    /// resets the stream position to 0 and re-queues.
    #[error("transcript truncated below offset {offset}: {path}")]
    FileTruncated { path: PathBuf, offset: u64 },

    /// The local embedding model failed to initialize within its timeout.
    /// If a remote key is configured the engine falls back for the cycle.
    #[error("embedding model initialization failed: {0}")]
    EmbeddingInit(String),

    /// A single text exceeded the remote token budget even after the
    /// maximum number of batch splits. The text is truncated with a
    /// warning; this kind only surfaces if truncation itself is impossible.
    #[error("text exceeds remote token budget after {splits} splits")]
    EmbeddingOverBudget { splits: u32 },

    /// The vector store refused the connection. The engine sleeps one loop
    /// tick and retries; `status()` reports degraded while it persists.
    #[error("vector store unavailable at {url}: {message}")]
    StoreUnavailable { url: String, message: String },

    /// Retryable I/O or HTTP failure (5xx, 429, timeout).
    #[error("transient: {0}")]
    Transient(String),

    /// A query resolved to an empty collection set. Returned as an empty
    /// result with a reason code, never a hard error.
    #[error("no collections matched the requested scope")]
    NoCollections,

    /// Invalid argument on the RPC surface, with the offending field.
    #[error("invalid argument `{field}`: {message}")]
    InvalidArgument { field: String, message: String },
}

impl RecallError {
    /// Whether the engine should retry the current file after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecallError::Transient(_) | RecallError::StoreUnavailable { .. }
        )
    }
}
