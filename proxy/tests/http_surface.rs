//! Integration tests for the control-plane HTTP surface that don't
//! require a real backend child process: health, status, and model
//! listing against an empty pool.

use http_body_util::BodyExt;
use modelproxy_core::config::ProxyConfig;
use modelproxy_core::content_index::ContentIndex;
use modelproxy_core::pool::BackendPool;
use modelproxy_core::port_allocator::PortAllocator;
use modelproxy_core::registry::ModelRegistry;
use modelproxy_core::server::{build_app_router, build_blob_router};
use modelproxy_core::state::AppState;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower::ServiceExt;

fn test_state(models_root: &std::path::Path) -> AppState {
    let mut config = ProxyConfig::default();
    config.models_root = models_root.to_string_lossy().to_string();
    config.backend_port_min = 43000;
    config.backend_port_max = 43010;
    let config = Arc::new(config);

    let registry = Arc::new(ModelRegistry::new(config.models_root_path()));
    let port_allocator = Arc::new(PortAllocator::new(
        config.backend_port_min,
        config.backend_port_max,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    ));
    let pool = Arc::new(BackendPool::new(config.clone(), registry.clone(), port_allocator));

    AppState {
        config,
        registry,
        pool,
        content_index: Arc::new(RwLock::new(ContentIndex::default())),
        peer: None,
        started_at: Instant::now(),
    }
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = build_app_router(test_state(tmp.path()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn v1_models_is_empty_for_fresh_models_root() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = build_app_router(test_state(tmp.path()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/models")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn api_status_reports_zero_resident_backends() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = build_app_router(test_state(tmp.path()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/api/status")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["models"].as_array().unwrap().len(), 0);
    assert_eq!(json["max_models"], 3);
}

#[tokio::test]
async fn chat_completions_without_model_field_is_bad_request() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = build_app_router(test_state(tmp.path()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(axum::body::Body::from("{\"messages\":[]}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_completions_for_unknown_model_is_not_found() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = build_app_router(test_state(tmp.path()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(axum::body::Body::from("{\"model\":\"nobody/nothing:Q4\",\"messages\":[]}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blob_endpoint_404s_for_unknown_hash() {
    let index = Arc::new(RwLock::new(ContentIndex::default()));
    let app = build_blob_router(index);

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/blob/deadbeef")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
}
