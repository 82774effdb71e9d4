//! Trigger and query HTTP server.
//!
//! Sync work is never done inside a request: trigger routes enqueue a job
//! on the [`SyncHandle`] and answer `202 Accepted`. Outcomes are observed
//! through `GET /documents/{document_id}`.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/reindex/{document_id}` | bearer | Force a re-index of one document |
//! | `POST` | `/webhook` | channel token or HMAC | Change notification; enqueues a poll |
//! | `POST` | `/bootstrap` | bearer | Full enumeration; commits the start token if the cursor is unchanged |
//! | `POST` | `/search` | bearer | Hybrid retrieval |
//! | `GET`  | `/documents/{document_id}` | bearer | Document status |
//! | `GET`  | `/health` | none | Liveness and version |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no document with id abc" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `unavailable` (503), `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use docsync_core::capability::Embedder;
use docsync_core::models::SourceDocument;
use docsync_core::search::ChunkResult;
use docsync_core::store::Store;

use crate::app;
use crate::config::{Config, RetrievalConfig};
use crate::search::{search_chunks, Query};
use crate::worker::{spawn_worker, Enqueued, SyncHandle, SyncJob};

type HmacSha256 = Hmac<Sha256>;

pub const CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
pub const SIGNATURE_HEADER: &str = "x-docsync-signature";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub handle: SyncHandle,
    pub retrieval: Arc<RetrievalConfig>,
    pub embedder: Option<Arc<dyn Embedder>>,
    /// Bearer token for trigger and query routes; `None` disables them.
    pub trigger_token: Option<String>,
    /// Webhook channel token and HMAC key; `None` rejects all webhooks.
    pub webhook_secret: Option<String>,
}

/// Start the worker and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let runtime = app::build_runtime(config).await?;
    let cancel = CancellationToken::new();

    let poll_interval = match config.sync.poll_interval_secs {
        0 => None,
        secs => Some(std::time::Duration::from_secs(secs)),
    };
    let (handle, worker) = spawn_worker(
        runtime.orchestrator.clone(),
        config.sync.queue_capacity,
        poll_interval,
        cancel.clone(),
    );

    let trigger_token = config.auth.trigger_token();
    if trigger_token.is_none() {
        tracing::warn!(
            env = %config.auth.trigger_token_env,
            "no trigger token configured; trigger and query routes will refuse requests"
        );
    }

    let state = AppState {
        store: runtime.store.clone(),
        handle,
        retrieval: Arc::new(config.retrieval.clone()),
        embedder: runtime.embedder.clone(),
        trigger_token,
        webhook_secret: config.auth.webhook_secret(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "docsync server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Err(err) = worker.await {
        tracing::error!(error = %err, "sync worker panicked");
    }
    runtime.store.pool().close().await;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/reindex/{document_id}", post(handle_reindex))
        .route("/webhook", post(handle_webhook))
        .route("/bootstrap", post(handle_bootstrap))
        .route("/search", post(handle_search))
        .route("/documents/{document_id}", get(handle_get_document))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
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

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::FORBIDDEN, "forbidden", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

// ============ Authentication ============

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Require `Authorization: Bearer <trigger token>`.
pub fn authorize_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AppError> {
    let expected = expected.ok_or_else(|| forbidden("trigger token is not configured"))?;
    let presented = header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(forbidden("invalid bearer token"))
    }
}

/// Accept a webhook carrying either the shared channel token or an
/// HMAC-SHA256 signature of the raw body.
pub fn authorize_webhook(headers: &HeaderMap, body: &[u8], secret: Option<&str>) -> Result<(), AppError> {
    let secret = secret.ok_or_else(|| forbidden("webhook secret is not configured"))?;

    if let Some(token) = header_str(headers, CHANNEL_TOKEN_HEADER) {
        return if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
            Ok(())
        } else {
            Err(forbidden("invalid channel token"))
        };
    }

    let signature = header_str(headers, SIGNATURE_HEADER)
        .ok_or_else(|| unauthorized("missing webhook credentials"))?;
    let hex_digest = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| forbidden("unsupported signature scheme"))?;
    let digest = hex::decode(hex_digest).map_err(|_| forbidden("malformed signature"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| internal(anyhow::anyhow!("invalid webhook key: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| forbidden("signature mismatch"))
}

/// Hex HMAC-SHA256 signature header value for `body`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ============ Trigger routes ============

#[derive(Serialize)]
struct Accepted {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
}

async fn handle_reindex(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    authorize_bearer(&headers, state.trigger_token.as_deref())?;

    if state
        .store
        .get_document(&document_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found(format!("no document with id {}", document_id)));
    }

    state
        .handle
        .submit(SyncJob::Reindex(document_id.clone()))
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    tracing::info!(document_id = %document_id, "re-index queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            document_id: Some(document_id),
        }),
    ))
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    authorize_webhook(&headers, &body, state.webhook_secret.as_deref())?;

    // Channel setup handshake; nothing changed yet.
    if header_str(&headers, RESOURCE_STATE_HEADER) == Some("sync") {
        return Ok(StatusCode::OK.into_response());
    }

    let enqueued = state
        .handle
        .request_poll()
        .map_err(|e| unavailable(e.to_string()))?;
    tracing::debug!(coalesced = enqueued == Enqueued::Coalesced, "webhook accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            document_id: None,
        }),
    )
        .into_response())
}

async fn handle_bootstrap(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    authorize_bearer(&headers, state.trigger_token.as_deref())?;
    state
        .handle
        .submit(SyncJob::Bootstrap)
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    tracing::info!("bootstrap queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            document_id: None,
        }),
    ))
}

// ============ Query routes ============

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub explain: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ChunkResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    authorize_bearer(&headers, state.trigger_token.as_deref())?;

    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }

    let query = Query {
        text: req.query,
        audience: req.audience,
        k: req.k,
        explain: req.explain,
    };
    let results = search_chunks(
        state.store.as_ref(),
        state.embedder.as_deref(),
        &state.retrieval,
        &query,
    )
    .await
    .map_err(internal)?;

    Ok(Json(SearchResponse { results }))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SourceDocument>, AppError> {
    authorize_bearer(&headers, state.trigger_token.as_deref())?;
    state
        .store
        .get_document(&document_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no document with id {}", document_id)))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    embeddings_enabled: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        embeddings_enabled: state.embedder.is_some(),
    })
}
