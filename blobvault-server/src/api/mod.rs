//! HTTP API endpoints
//!
//! Timestamps, node ids and blob keys travel in path segments and headers in
//! the safe-byte encoding; path segments additionally percent-escape every
//! byte that is not ASCII alphanumeric.

use axum::{
    extract::{DefaultBodyLimit, OriginalUri, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
    Router,
};
use blobvault_core::codec::{self, decode_timestamp, unescape_segment};
use blobvault_core::{Backend, BlobError, Timestamp};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Largest request body accepted as a blob
pub const MAX_BLOB_SIZE: usize = 64 << 20;

/// Backends served by this process
pub struct AppState {
    backends: Vec<Backend>,
}

impl AppState {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    /// Backend with the most free capacity; ties go to the later entry
    fn pick(&self) -> Option<&Backend> {
        self.backends
            .iter()
            .max_by_key(|backend| backend.storage.free_capacity())
    }

    fn find(&self, node: &[u8]) -> Option<&Backend> {
        self.backends
            .iter()
            .find(|backend| node_name(backend).as_bytes() == node)
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/blobs/:ts", post(post_blob))
        .route("/blobs/:node/:id", get(get_blob))
        // EXPIRE is not a standard method, so the handler filters itself.
        .route("/expire/:ts", any(expire))
        .layer(DefaultBodyLimit::max(MAX_BLOB_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown node")]
    UnknownNode,

    #[error("no backend available")]
    NoBackend,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Storage(#[from] BlobError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownNode => StatusCode::NOT_FOUND,
            ApiError::NoBackend => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Storage(BlobError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Storage(BlobError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            ApiError::Storage(e) if e.is_policy_rejection() => StatusCode::CONFLICT,
            ApiError::Storage(e) => {
                warn!("Storage failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub backends: Vec<BackendStats>,
}

#[derive(Debug, Serialize)]
pub struct BackendStats {
    pub name: String,
    pub node: String,
    pub free_capacity: i64,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: blobvault_core::VERSION.to_string(),
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        backends: state
            .backends
            .iter()
            .map(|backend| BackendStats {
                name: backend.name.clone(),
                node: node_name(backend),
                free_capacity: backend.storage.free_capacity(),
            })
            .collect(),
    })
}

async fn post_blob(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<(StatusCode, HeaderMap), ApiError> {
    let at = timestamp_segment(&uri)?;
    let backend = state.pick().ok_or(ApiError::NoBackend)?.clone();

    let storage = backend.storage.clone();
    let key = tokio::task::spawn_blocking(move || storage.store(&body, at))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    debug!("Stored {} byte key on {}", key.len(), backend.name);

    let mut headers = HeaderMap::new();
    headers.insert("node", header_value(node_name(&backend).as_bytes())?);
    headers.insert("id", header_value(&key)?);
    Ok((StatusCode::NO_CONTENT, headers))
}

async fn get_blob(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
) -> Result<(HeaderMap, Vec<u8>), ApiError> {
    let (node, key) = match path_segments(&uri).as_slice() {
        [node, id] => (codec::decode(node), codec::decode(id)),
        _ => return Err(ApiError::BadRequest("expected /blobs/{node}/{id}".into())),
    };
    let backend = state.find(&node).ok_or(ApiError::UnknownNode)?.clone();

    let loaded = tokio::task::spawn_blocking(move || backend.storage.load(&key))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    let mut headers = HeaderMap::new();
    headers.insert("lz4-size", HeaderValue::from(loaded.decompressed_len));
    Ok((headers, loaded.data))
}

/// Fan the cutoff out to every backend and answer before any of them finish.
async fn expire(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> Result<StatusCode, ApiError> {
    if method != Method::POST && method.as_str() != "EXPIRE" {
        return Err(ApiError::MethodNotAllowed);
    }
    let cutoff = timestamp_segment(&uri)?;
    info!("Expiring blobs before {}", describe(cutoff));

    for backend in &state.backends {
        let backend = backend.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = backend.storage.expire(cutoff) {
                warn!("Expire on {} failed: {}", backend.name, e);
            }
        });
    }

    Ok(StatusCode::OK)
}

// ============================================================================
// Wire helpers
// ============================================================================

/// Node name on the wire: the backend's hyphenated UUID
fn node_name(backend: &Backend) -> String {
    backend.node.hyphenated().to_string()
}

/// Path segments after the route name, unescaped once.
///
/// Taken from the raw request target: the safe-byte encoding is not UTF-8, so
/// it cannot go through the router's string parameters.
fn path_segments(uri: &Uri) -> Vec<Vec<u8>> {
    uri.path().split('/').skip(2).map(unescape_segment).collect()
}

fn timestamp_segment(uri: &Uri) -> Result<Timestamp, ApiError> {
    match path_segments(uri).as_slice() {
        [ts] => Ok(decode_timestamp(ts)),
        _ => Err(ApiError::BadRequest("expected a single timestamp segment".into())),
    }
}

fn header_value(raw: &[u8]) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_bytes(&codec::encode(raw)).map_err(|e| ApiError::Internal(e.to_string()))
}

fn describe(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
