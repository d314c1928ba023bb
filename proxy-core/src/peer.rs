//! Peer Service — mDNS presence advertisement and discovery between
//! sibling proxy instances on the local network, plus the `/blob/<hash>`
//! content-transfer endpoints peers use to fetch a model blob from each
//! other instead of re-downloading it.
//!
//! The background-loop shape (a `tokio::select!` racing a
//! `CancellationToken` against a periodic tick) follows the same pattern
//! the discovery/health background loops use for their prune sweeps.

use crate::config::ProxyConfig;
use crate::content_index::ContentIndex;
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SERVICE_TYPE: &str = "_modelproxy._tcp.local.";

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub host_name: String,
    pub addresses: Vec<std::net::IpAddr>,
    pub port: u16,
}

pub struct PeerService {
    config: Arc<ProxyConfig>,
    daemon: ServiceDaemon,
    known_peers: RwLock<HashMap<String, PeerInfo>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverMode {
    /// Fixed 1s browse window, first-wave answers only.
    Quick,
    /// 3s browse window, de-duplicated against everything seen so far.
    Thorough,
}

impl PeerService {
    pub fn new(config: Arc<ProxyConfig>) -> std::io::Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(Self {
            config,
            daemon,
            known_peers: RwLock::new(HashMap::new()),
        })
    }

    /// Advertise this instance's presence over mDNS under the configured
    /// service tag.
    pub fn advertise(&self) -> std::io::Result<()> {
        let host_name = format!(
            "{}-{}.local.",
            self.config.service_tag,
            std::process::id()
        );
        let instance_name = format!("{}-{}", self.config.service_tag, std::process::id());
        let port = self.config.resolved_peer_port();

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &host_name,
            "",
            port,
            None,
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
        .enable_addr_auto();

        self.daemon
            .register(service)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        info!(port, "advertising peer presence via mDNS");
        Ok(())
    }

    /// Discover sibling instances. `Quick` browses for a fixed 1s window
    /// and returns whatever answers in that first wave; `Thorough` browses
    /// for 3s, de-duplicating against everything seen so far.
    pub async fn discover(&self, mode: DiscoverMode) -> Vec<PeerInfo> {
        let window = match mode {
            DiscoverMode::Quick => Duration::from_secs(1),
            DiscoverMode::Thorough => Duration::from_secs(3),
        };
        self.browse_once(window).await;
        self.known_peers.read().await.values().cloned().collect()
    }

    async fn browse_once(&self, window: Duration) {
        let receiver = match self.daemon.browse(SERVICE_TYPE) {
            Ok(r) => r,
            Err(e) => {
                warn!("mdns browse failed: {e}");
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, async { receiver.recv_async().await }).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let peer = PeerInfo {
                        host_name: info.get_hostname().to_string(),
                        addresses: info.get_addresses().iter().cloned().collect(),
                        port: info.get_port(),
                    };
                    debug!(host = %peer.host_name, "resolved peer");
                    self.known_peers
                        .write()
                        .await
                        .insert(peer.host_name.clone(), peer);
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }

    /// Background sweep pruning peers that have not been re-resolved
    /// recently, run as an independent task alongside the idle reaper.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("peer service shutting down");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(60)) => {
                    self.browse_once(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct BlobState {
    pub index: Arc<RwLock<ContentIndex>>,
}

/// `HEAD /blob/:hash` — existence and size check without a body.
pub async fn head_blob(
    State(state): State<BlobState>,
    AxumPath(hash): AxumPath<String>,
) -> Response {
    let index = state.index.read().await;
    match index.lookup(&hash) {
        Some(path) => match std::fs::metadata(path) {
            Ok(meta) => {
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_LENGTH, meta.len().into());
                headers.insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
                (StatusCode::OK, headers).into_response()
            }
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /blob/:hash` — serves the blob content, honoring a `Range` header
/// for resumable peer-to-peer transfer.
pub async fn get_blob(
    State(state): State<BlobState>,
    AxumPath(hash): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let index = state.index.read().await;
    let Some(path) = index.lookup(&hash).map(|p| p.to_path_buf()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    drop(index);

    let Ok(mut file) = tokio::fs::File::open(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let total_len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range)
        .map(|(start, end)| (start, end.min(total_len.saturating_sub(1))));

    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    if let Some((start, end)) = range {
        if start > end || start >= total_len {
            let mut resp_headers = HeaderMap::new();
            resp_headers.insert(
                header::CONTENT_RANGE,
                header::HeaderValue::from_str(&format!("bytes */{total_len}")).unwrap(),
            );
            return (StatusCode::RANGE_NOT_SATISFIABLE, resp_headers).into_response();
        }
        let len = end - start + 1;
        if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let mut buf = vec![0u8; len as usize];
        if file.read_exact(&mut buf).await.is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(header::CONTENT_LENGTH, len.into());
        resp_headers.insert(
            header::CONTENT_RANGE,
            header::HeaderValue::from_str(&format!("bytes {start}-{end}/{total_len}")).unwrap(),
        );
        resp_headers.insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
        (StatusCode::PARTIAL_CONTENT, resp_headers, Body::from(buf)).into_response()
    } else {
        let stream = tokio_util::io::ReaderStream::new(file);
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(header::CONTENT_LENGTH, total_len.into());
        resp_headers.insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
        (StatusCode::OK, resp_headers, Body::from_stream(stream)).into_response()
    }
}

/// Parse a single-range `bytes=START-END` header value. Open-ended ranges
/// (`bytes=START-`) resolve their end at call sites by clamping to the
/// file length.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    let end: u64 = if end_str.is_empty() {
        u64::MAX
    } else {
        end_str.parse().ok()?
    };
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_range() {
        assert_eq!(parse_range("bytes=0-99"), Some((0, 99)));
    }

    #[test]
    fn parse_open_ended_range() {
        assert_eq!(parse_range("bytes=100-"), Some((100, u64::MAX)));
    }

    #[test]
    fn parse_rejects_malformed_range() {
        assert_eq!(parse_range("chunks=0-99"), None);
    }
}
