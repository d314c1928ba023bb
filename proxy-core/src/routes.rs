//! Route table and handlers for the Reverse Proxy's HTTP surface (§6).
//!
//! New forwarding endpoints are added as data — an entry in [`ROUTES`] —
//! rather than a new code path; every entry with `parses_model: true`
//! shares the one `forward_model_request` handler.

use crate::error::{ProxyError, ProxyResult};
use crate::pool::BackendState;
use crate::state::AppState;
use crate::supervisor::SpawnOpts;
use axum::body::Body;
use axum::extract::{Json as JsonExtractor, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One entry of the `(method, path) -> {parses_model, streaming}` table
/// referenced in the design notes: new wire endpoints are added by
/// extending this table, not by writing a new handler.
pub struct RouteSpec {
    pub method: Method,
    pub path: &'static str,
    pub parses_model: bool,
    pub streaming: bool,
}

pub fn route_table() -> Vec<RouteSpec> {
    vec![
        RouteSpec { method: Method::POST, path: "/v1/chat/completions", parses_model: true, streaming: true },
        RouteSpec { method: Method::POST, path: "/v1/completions", parses_model: true, streaming: true },
        RouteSpec { method: Method::POST, path: "/v1/messages", parses_model: true, streaming: true },
        RouteSpec { method: Method::POST, path: "/v1/embeddings", parses_model: true, streaming: false },
        RouteSpec { method: Method::GET, path: "/v1/models", parses_model: false, streaming: false },
        RouteSpec { method: Method::GET, path: "/health", parses_model: false, streaming: false },
        RouteSpec { method: Method::GET, path: "/api/status", parses_model: false, streaming: false },
        RouteSpec { method: Method::POST, path: "/api/run", parses_model: true, streaming: false },
        RouteSpec { method: Method::POST, path: "/api/stop", parses_model: false, streaming: false },
        RouteSpec { method: Method::POST, path: "/api/stop-all", parses_model: false, streaming: false },
    ]
}

/// Shared handler for every `parses_model: true` forwarding endpoint.
pub async fn forward_model_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match forward_model_request_inner(state, method, uri, headers, body).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn forward_model_request_inner(
    state: AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> ProxyResult<Response> {
    let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| ProxyError::BodyTooLarge)?;

    let value: Value = serde_json::from_slice(&bytes).map_err(|e| ProxyError::BadRequest {
        detail: format!("invalid JSON body: {e}"),
    })?;
    let model_query = value
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| ProxyError::BadRequest {
            detail: "request body missing \"model\" field".into(),
        })?
        .to_string();

    let backend = state.pool.acquire(&model_query, &SpawnOpts::default()).await?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    backend
        .forward(method, path_and_query, headers, Body::from(bytes))
        .await
}

/// `GET /v1/models` — canonical identifiers known to the Model Registry.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models: Vec<String> = state.registry.list().iter().map(|m| m.canonical()).collect();
    Json(json!({ "data": models }))
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct ModelStatusEntry {
    model_name: String,
    port: u16,
    status: &'static str,
    idle_minutes: f64,
    started_at: i64,
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_seconds: u64,
    max_models: usize,
    idle_timeout: String,
    models: Vec<ModelStatusEntry>,
}

/// `GET /api/status`
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshots = state.pool.snapshot().await;
    let now_ms = now_epoch_ms();

    let models = snapshots
        .into_iter()
        .map(|s| {
            let status = match s.state {
                BackendState::Starting => "starting",
                BackendState::Ready => "ready",
                BackendState::Draining => "draining",
                BackendState::Dead => "dead",
            };
            let idle_ms = (now_ms - s.last_used_ms).max(0);
            ModelStatusEntry {
                model_name: s.model,
                port: s.port,
                status,
                idle_minutes: idle_ms as f64 / 60_000.0,
                started_at: s.last_used_ms,
            }
        })
        .collect();

    Json(StatusResponse {
        uptime_seconds: state.uptime_secs(),
        max_models: state.config.max_models,
        idle_timeout: format!("{}m", state.config.idle_timeout_mins),
        models,
    })
}

#[derive(Deserialize)]
pub struct RunRequest {
    model: String,
    #[serde(default)]
    options: Option<SpawnOpts>,
}

/// `POST /api/run` — ensures a backend is Ready and returns 202. Per the
/// recorded design decision this returns only after `pool.acquire`
/// resolves to a healthy backend, not before. `options` overlays
/// `ctx_size`/`gpu_layers`/`threads` (plus any passthrough keys) onto the
/// backend's spawn args when this request is the one that admits it.
pub async fn api_run(
    State(state): State<AppState>,
    JsonExtractor(req): JsonExtractor<RunRequest>,
) -> Response {
    let opts = req.options.unwrap_or_default();
    match state.pool.acquire(&req.model, &opts).await {
        Ok(backend) => (
            StatusCode::ACCEPTED,
            Json(json!({ "model": backend.model.id.canonical(), "port": backend.port })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct StopRequest {
    model: String,
}

/// `POST /api/stop`
pub async fn api_stop(
    State(state): State<AppState>,
    JsonExtractor(req): JsonExtractor<StopRequest>,
) -> Response {
    match state.pool.stop(&req.model, false).await {
        Ok(()) => Json(json!({ "stopped": true })).into_response(),
        Err(ProxyError::NotResident { model }) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "stopped": false, "model": model })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /api/stop-all`
pub async fn api_stop_all(State(state): State<AppState>) -> impl IntoResponse {
    let before = state.pool.snapshot().await.len();
    state.pool.stop_all().await;
    Json(json!({ "stopped": before }))
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
