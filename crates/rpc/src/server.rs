use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use permastore_ledger::Ledger;
use permastore_replication::{Registry, Replicator, SyncReport};
use permastore_store::{ContentStore, StoreError};
use permastore_types::Block;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared node state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Mutex<Ledger>>,
    pub store: Arc<ContentStore>,
    pub registry: Arc<dyn Registry>,
    pub replicator: Arc<Replicator>,
    pub node_id: String,
    /// Upload size cap in bytes, enforced before the store is touched.
    pub max_file_size: u64,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
}

impl AppState {
    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct UploadResponse {
    hash: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    blockchain_length: u64,
    peers: Vec<String>,
    last_block: Option<Block>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
}

#[derive(Debug, Serialize)]
struct PeersResponse {
    peers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddPeerRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn payload_too_large<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

/// Serve the node API on `addr` until the server terminates.
pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let shared = Arc::new(state);
    let app = build_router(shared);
    let listener = bind_listener(addr).await?;
    axum::serve(listener, app)
        .await
        .context("API server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind API listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind API listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    // Body limit sits above the upload cap so the handler can reject
    // oversized files with a clean 413 instead of an aborted read.
    let body_limit = (state.max_file_size as usize).saturating_add(1024 * 1024);

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/download/:hash", get(handle_download))
        .route("/retrieve/:hash", get(handle_download))
        .route("/peers", get(handle_get_peers).post(handle_add_peer))
        .route("/peers/*url", delete(handle_remove_peer))
        .route("/sync", post(handle_sync))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Store an uploaded file, record it in the ledger and broadcast it to
/// every registered peer.
async fn handle_upload(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    state.record_request();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart payload: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?;

        if bytes.len() as u64 > state.max_file_size {
            return Err(ApiError::payload_too_large("File too large"));
        }

        let hash = state
            .store
            .put(&bytes)
            .map_err(|err| ApiError::internal(format!("failed to store file: {err}")))?;

        {
            let mut ledger = state.ledger.lock();
            ledger
                .append_transaction(json!({
                    "hash": hash,
                    "filename": filename,
                    "content_type": content_type,
                    "size": bytes.len(),
                }))
                .map_err(|err| ApiError::internal(format!("failed to record file: {err}")))?;
        }

        match state.replicator.broadcast_file(&hash).await {
            Ok(report) => debug!(
                "Broadcast {hash}: {} succeeded, {} failed",
                report.succeeded.len(),
                report.failed.len()
            ),
            Err(err) => warn!("Broadcast of {hash} failed: {err}"),
        }

        return Ok(Json(UploadResponse {
            hash,
            message: "File uploaded successfully",
        }));
    }

    Err(ApiError::bad_request("multipart payload has no file field"))
}

async fn handle_download(
    State(state): State<SharedState>,
    AxumPath(hash): AxumPath<String>,
) -> Result<Response, ApiError> {
    state.record_request();

    let bytes = match state.store.get(&hash) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(ApiError::not_found("File not found")),
        Err(StoreError::InvalidHash(_)) => {
            return Err(ApiError::bad_request("invalid content hash"))
        }
        Err(err) => return Err(ApiError::internal(format!("failed to read file: {err}"))),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{hash}\""),
        )
        .body(Body::from(bytes))
        .map_err(|err| ApiError::internal(format!("failed to build response: {err}")))
}

async fn handle_get_peers(State(state): State<SharedState>) -> Json<PeersResponse> {
    state.record_request();
    Json(PeersResponse {
        peers: state.registry.list(),
    })
}

async fn handle_add_peer(
    State(state): State<SharedState>,
    Json(request): Json<AddPeerRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.record_request();

    let admitted = state
        .registry
        .admit(&request.url)
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid peer url: {err}")))?;

    if admitted {
        Ok(Json(MessageResponse {
            message: format!("Peer added: {}", request.url),
        }))
    } else {
        Err(ApiError::bad_request("Failed to add peer"))
    }
}

async fn handle_remove_peer(
    State(state): State<SharedState>,
    AxumPath(url): AxumPath<String>,
) -> Json<MessageResponse> {
    state.record_request();
    state.registry.evict(&url);
    Json(MessageResponse {
        message: format!("Peer removed: {url}"),
    })
}

async fn handle_sync(State(state): State<SharedState>) -> Json<SyncReport> {
    state.record_request();
    Json(state.replicator.sync_files().await)
}

async fn handle_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    state.record_request();
    let ledger = state.ledger.lock();
    Json(StatusResponse {
        blockchain_length: ledger.len() as u64,
        peers: state.registry.list(),
        last_block: ledger.tip().cloned(),
    })
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    state.record_request();
    Json(HealthResponse {
        status: "healthy",
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_seconds(),
    })
}
