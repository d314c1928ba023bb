//! HTTP server wiring: axum `Router` assembly, trace/CORS/body-size
//! middleware, per the management console's `Router::new().route(...)`
//! convention, generalized to this proxy's forwarding + control surface.
//!
//! Two independent routers, not one merged one: the app router (forwarding
//! + control API) binds at `config.port`, while the blob-transfer router
//! binds at `config.resolved_peer_port()`. mDNS only ever advertises the
//! latter, and the two default to different ports, so merging them into a
//! single bound listener would leave the advertised port unserved.

use crate::content_index::ContentIndex;
use crate::peer::{self, BlobState};
use crate::routes;
use crate::state::AppState;
use axum::routing::{get, head, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Forwarding + control API router, bound at `config.port`.
pub fn build_app_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;

    // Passthrough forwarding endpoints are registered straight off the route
    // table so a new one is added by data, not a new handler. `/api/run`
    // also parses a `model` field but has its own acquire-then-202 handler,
    // not a raw passthrough, so it is wired explicitly below instead.
    let mut app_routes = Router::new();
    for entry in routes::route_table() {
        if entry.parses_model && entry.path.starts_with("/v1/") {
            app_routes = app_routes.route(entry.path, post(routes::forward_model_request));
        }
    }

    app_routes
        .route("/v1/models", get(routes::list_models))
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::status))
        .route("/api/run", post(routes::api_run))
        .route("/api/stop", post(routes::api_stop))
        .route("/api/stop-all", post(routes::api_stop_all))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

/// `/blob/<hash>` transfer router, bound at `config.resolved_peer_port()` —
/// the port mDNS actually advertises to peers.
pub fn build_blob_router(content_index: Arc<RwLock<ContentIndex>>) -> Router {
    let blob_state = BlobState { index: content_index };
    Router::new()
        .route("/blob/:hash", head(peer::head_blob).get(peer::get_blob))
        .with_state(blob_state)
        .layer(TraceLayer::new_for_http())
}
