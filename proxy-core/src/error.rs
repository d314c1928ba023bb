//! Error taxonomy for the proxy core.
//!
//! Each variant is a distinct surface code (§7 of the design): it carries
//! exactly the context needed to both answer the client and emit a
//! structured log line. Handlers map a `ProxyError` straight to an HTTP
//! response via `IntoResponse`; nothing upstream needs a second mapping
//! table.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("model not found: {query}")]
    ModelNotFound {
        query: String,
        suggestions: Vec<String>,
    },

    #[error("model query ambiguous: {query}")]
    ModelAmbiguous {
        query: String,
        candidates: Vec<String>,
    },

    #[error("backend for {model} failed to start: {detail}")]
    StartupFailure { model: String, detail: String },

    #[error("backend for {model} did not become healthy in time")]
    StartupTimeout { model: String },

    #[error("pool busy, no eviction candidate available")]
    PoolBusy { retry_after: Duration },

    #[error("backend transport error: {detail}")]
    BackendTransport { detail: String },

    #[error("client cancelled the request")]
    ClientCancelled,

    #[error("no free port in configured range")]
    PortsExhausted,

    #[error("another proxy instance is already running at {host}:{port} (pid {pid})")]
    AlreadyRunning { host: String, port: u16, pid: u32 },

    #[error("request body too large")]
    BodyTooLarge,

    #[error("malformed request body: {detail}")]
    BadRequest { detail: String },

    #[error("model {model} is not resident")]
    NotResident { model: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ProxyError {
    /// Short tag used in structured log lines (`kind` field of §7).
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::ModelNotFound { .. } => "ModelNotFound",
            ProxyError::ModelAmbiguous { .. } => "ModelAmbiguous",
            ProxyError::StartupFailure { .. } => "StartupFailure",
            ProxyError::StartupTimeout { .. } => "StartupTimeout",
            ProxyError::PoolBusy { .. } => "PoolBusy",
            ProxyError::BackendTransport { .. } => "BackendTransport",
            ProxyError::ClientCancelled => "ClientCancelled",
            ProxyError::PortsExhausted => "PortsExhausted",
            ProxyError::AlreadyRunning { .. } => "AlreadyRunning",
            ProxyError::BodyTooLarge => "BodyTooLarge",
            ProxyError::BadRequest { .. } => "BadRequest",
            ProxyError::NotResident { .. } => "NotResident",
            ProxyError::Io(_) => "Io",
            ProxyError::Json(_) => "Json",
            ProxyError::Yaml(_) => "Yaml",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::ModelNotFound { query, suggestions } => {
                tracing::warn!(kind = self.kind(), query, ?suggestions, "model not found");
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "model_not_found", "query": query, "suggestions": suggestions})),
                )
                    .into_response()
            }
            ProxyError::ModelAmbiguous { query, candidates } => {
                tracing::warn!(kind = self.kind(), query, ?candidates, "model query ambiguous");
                (
                    StatusCode::CONFLICT,
                    Json(json!({"error": "model_ambiguous", "query": query, "candidates": candidates})),
                )
                    .into_response()
            }
            ProxyError::StartupFailure { model, detail } => {
                tracing::error!(kind = self.kind(), model, detail, "backend startup failed");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "startup_failure", "model": model, "detail": detail})),
                )
                    .into_response()
            }
            ProxyError::StartupTimeout { model } => {
                tracing::error!(kind = self.kind(), model, "backend startup timed out");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    Json(json!({"error": "startup_timeout", "model": model})),
                )
                    .into_response()
            }
            ProxyError::PoolBusy { retry_after } => {
                tracing::warn!(kind = self.kind(), retry_after_secs = retry_after.as_secs(), "pool busy");
                let mut resp = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": "pool_busy"})),
                )
                    .into_response();
                resp.headers_mut().insert(
                    axum::http::header::RETRY_AFTER,
                    axum::http::HeaderValue::from_str(&retry_after.as_secs().to_string())
                        .expect("digit string is a valid header value"),
                );
                resp
            }
            ProxyError::BackendTransport { detail } => {
                tracing::error!(kind = self.kind(), detail, "backend transport error");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "backend_transport", "detail": detail})),
                )
                    .into_response()
            }
            ProxyError::ClientCancelled => {
                tracing::info!(kind = self.kind(), "client cancelled");
                StatusCode::OK.into_response()
            }
            ProxyError::PortsExhausted => {
                tracing::error!(kind = self.kind(), "no free backend port");
                let mut resp = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": "ports_exhausted"})),
                )
                    .into_response();
                resp.headers_mut().insert(
                    axum::http::header::RETRY_AFTER,
                    axum::http::HeaderValue::from_static("5"),
                );
                resp
            }
            ProxyError::AlreadyRunning { host, port, pid } => {
                tracing::error!(kind = self.kind(), host, port, pid, "proxy already running");
                (
                    StatusCode::CONFLICT,
                    Json(json!({"error": "already_running", "host": host, "port": port, "pid": pid})),
                )
                    .into_response()
            }
            ProxyError::BodyTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({"error": "body_too_large"}))).into_response()
            }
            ProxyError::BadRequest { detail } => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": "bad_request", "detail": detail}))).into_response()
            }
            ProxyError::NotResident { model } => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not_resident", "model": model}))).into_response()
            }
            ProxyError::Io(e) => {
                tracing::error!(kind = self.kind(), detail = %e, "io error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "io_error"}))).into_response()
            }
            ProxyError::Json(e) => {
                tracing::error!(kind = self.kind(), detail = %e, "json error");
                (StatusCode::BAD_REQUEST, Json(json!({"error": "json_error"}))).into_response()
            }
            ProxyError::Yaml(e) => {
                tracing::error!(kind = self.kind(), detail = %e, "yaml error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "yaml_error"}))).into_response()
            }
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
