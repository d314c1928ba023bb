//! Shared application state threaded through every axum handler via
//! `State<AppState>`.

use crate::config::ProxyConfig;
use crate::content_index::ContentIndex;
use crate::peer::PeerService;
use crate::pool::BackendPool;
use crate::registry::ModelRegistry;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub registry: Arc<ModelRegistry>,
    pub pool: Arc<BackendPool>,
    pub content_index: Arc<RwLock<ContentIndex>>,
    pub peer: Option<Arc<PeerService>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
