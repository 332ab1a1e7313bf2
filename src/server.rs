//! HTTP tool surface for agents.
//!
//! Exposes the retrieval operations via a JSON HTTP API suitable for
//! integration with MCP-style tool hosts.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/reflect` | Search past conversations and reflections |
//! | `POST` | `/tools/store_reflection` | Store a user-authored reflection |
//! | `POST` | `/tools/get_conversation` | Fetch a transcript's raw content |
//! | `GET`  | `/status` | Engine health and progress |
//! | `GET`  | `/health` | Liveness check (returns version) |
//!
//! # Caller context
//!
//! The client's working directory rides in the `x-recall-cwd` header and
//! scopes project resolution for requests that don't name a project. The
//! server's own cwd is never consulted.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_argument", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `invalid_argument` (400), `not_found` (404),
//! `internal` (500). Responses never carry stack traces; full detail goes
//! to the logs.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::engine::StatusHandle;
use crate::error::RecallError;
use crate::retrieval::{ReflectRequest, ResponseFormat, RetrievalEngine};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    retrieval: Arc<RetrievalEngine>,
    status: StatusHandle,
}

/// Start the tool server on the configured bind address. Runs until the
/// process terminates.
pub async fn run_server(
    bind: &str,
    retrieval: Arc<RetrievalEngine>,
    status: StatusHandle,
) -> anyhow::Result<()> {
    let state = AppState { retrieval, status };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/reflect", post(handle_reflect))
        .route("/tools/store_reflection", post(handle_store_reflection))
        .route("/tools/get_conversation", post(handle_get_conversation))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind, "tool server listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Surface only the kind plus a short message; log the full chain.
fn map_error(e: anyhow::Error) -> AppError {
    match e.downcast_ref::<RecallError>() {
        Some(RecallError::InvalidArgument { field, message }) => AppError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_argument".to_string(),
            message: format!("{field}: {message}"),
        },
        Some(RecallError::FileGone(path)) => AppError {
            status: StatusCode::NOT_FOUND,
            code: "not_found".to_string(),
            message: format!("conversation not found: {}", path.display()),
        },
        _ => {
            error!(error = ?e, "request failed");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: e.to_string(),
            }
        }
    }
}

fn caller_cwd(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-recall-cwd")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

// ============ POST /tools/reflect ============

#[derive(Deserialize)]
struct ReflectBody {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    min_score: f64,
    #[serde(default)]
    project: Option<String>,
    /// -1 = server default, 0 = off, 1 = on.
    #[serde(default = "default_use_decay")]
    use_decay: i8,
    #[serde(default)]
    brief: bool,
    /// "structured" or "markdown".
    #[serde(default = "default_format")]
    response_format: String,
    #[serde(default)]
    include_raw: bool,
}

fn default_limit() -> usize {
    5
}
fn default_use_decay() -> i8 {
    -1
}
fn default_format() -> String {
    "structured".to_string()
}

#[derive(Serialize)]
struct ReflectResponseBody {
    result: String,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn handle_reflect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReflectBody>,
) -> Result<Json<ReflectResponseBody>, AppError> {
    let response_format = match body.response_format.as_str() {
        "structured" => ResponseFormat::Structured,
        "markdown" => ResponseFormat::Markdown,
        other => {
            return Err(AppError {
                status: StatusCode::BAD_REQUEST,
                code: "invalid_argument".to_string(),
                message: format!("response_format: unknown value '{other}'"),
            })
        }
    };
    if !(0.0..=1.0).contains(&body.min_score) {
        return Err(AppError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_argument".to_string(),
            message: "min_score: must be in [0.0, 1.0]".to_string(),
        });
    }

    let request = ReflectRequest {
        query: body.query,
        limit: body.limit,
        min_score: body.min_score,
        project: body.project,
        use_decay: body.use_decay,
        brief: body.brief,
        response_format,
        include_raw: body.include_raw,
    };
    let cwd = caller_cwd(&headers);
    let outcome = state
        .retrieval
        .reflect_on_past(&request, cwd.as_deref())
        .await
        .map_err(map_error)?;

    Ok(Json(ReflectResponseBody {
        result: outcome.text,
        count: outcome.count,
        reason: outcome.reason.map(str::to_string),
    }))
}

// ============ POST /tools/store_reflection ============

#[derive(Deserialize)]
struct StoreReflectionBody {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize)]
struct StoreReflectionResponse {
    id: String,
    stored: bool,
}

async fn handle_store_reflection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StoreReflectionBody>,
) -> Result<Json<StoreReflectionResponse>, AppError> {
    let cwd = caller_cwd(&headers);
    let id = state
        .retrieval
        .store_reflection(&body.content, &body.tags, cwd.as_deref())
        .await
        .map_err(map_error)?;
    Ok(Json(StoreReflectionResponse {
        id: id.to_string(),
        stored: true,
    }))
}

// ============ POST /tools/get_conversation ============

#[derive(Deserialize)]
struct GetConversationBody {
    conversation_id: String,
    #[serde(default)]
    project: Option<String>,
}

#[derive(Serialize)]
struct GetConversationResponse {
    conversation_id: String,
    content: String,
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GetConversationBody>,
) -> Result<Json<GetConversationResponse>, AppError> {
    let cwd = caller_cwd(&headers);
    let content = state
        .retrieval
        .get_full_conversation(&body.conversation_id, body.project.as_deref(), cwd.as_deref())
        .await
        .map_err(map_error)?;
    Ok(Json(GetConversationResponse {
        conversation_id: body.conversation_id,
        content,
    }))
}

// ============ GET /status ============

#[derive(Serialize)]
struct StatusResponse {
    collection_count: usize,
    indexed_files: usize,
    pending_files: usize,
    indexing_percentage: f64,
    cpu_percent: f32,
    memory_mb: u64,
    embedding_provider: String,
    last_cycle_age_seconds: u64,
    store_degraded: bool,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.status.snapshot();
    let total = snapshot.indexed_files + snapshot.pending_files;
    let indexing_percentage = if total > 0 {
        snapshot.indexed_files as f64 * 100.0 / total as f64
    } else {
        100.0
    };
    Json(StatusResponse {
        collection_count: state.retrieval.collection_count().await,
        indexed_files: snapshot.indexed_files,
        pending_files: snapshot.pending_files,
        indexing_percentage,
        cpu_percent: snapshot.cpu_percent,
        memory_mb: snapshot.memory_mb,
        embedding_provider: state.retrieval.provider_name().to_string(),
        last_cycle_age_seconds: snapshot.last_cycle_age_secs,
        store_degraded: snapshot.store_degraded,
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
