//! `modelproxy` — entry point for the local multi-backend inference proxy.
//!
//! Boot sequence: init logging, load config, claim the presence record
//! (refusing if another instance is live and healthy), rebuild the content
//! index from installed manifests, construct the pool, bind the app router
//! and — when peer discovery is enabled — the separate blob-transfer
//! router on its own advertised port, spawn the idle reaper (and the peer
//! service), then serve until a signal arrives.

use anyhow::{Context, Result};
use modelproxy_core::config::{load_config, ProxyConfig};
use modelproxy_core::content_index::ContentIndex;
use modelproxy_core::peer::PeerService;
use modelproxy_core::pool::BackendPool;
use modelproxy_core::port_allocator::PortAllocator;
use modelproxy_core::presence::{check_and_claim, PresenceRecord};
use modelproxy_core::registry::ModelRegistry;
use modelproxy_core::server::{build_app_router, build_blob_router};
use modelproxy_core::state::AppState;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("modelproxy: fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn run() -> Result<i32> {
    init_logging();

    info!("========================================");
    info!("  modelproxy v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    let config = load_config().context("failed to load configuration")?;

    let presence_path = config.presence_path();
    let presence = match check_and_claim(&presence_path, &config.host, config.port).await {
        Ok(p) => p,
        Err(e) => {
            error!(kind = "AlreadyRunning", "{e}");
            return Ok(1);
        }
    };

    std::fs::create_dir_all(config.models_root_path())
        .with_context(|| format!("failed to create models_root at {}", config.models_root_path().display()))?;
    std::fs::create_dir_all(config.bin_dir())
        .with_context(|| format!("failed to create bin dir at {}", config.bin_dir().display()))?;

    let config = Arc::new(config);
    let registry = Arc::new(ModelRegistry::new(config.models_root_path()));

    let content_index = ContentIndex::rebuild(&registry, &config.content_index_path())
        .unwrap_or_else(|e| {
            warn!("failed to rebuild content index, falling back to on-disk copy: {e}");
            ContentIndex::load(&config.content_index_path())
        });
    info!(entries = content_index.len(), "content index rebuilt");

    let bind_ip: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid host address: {}", config.host))?;
    let port_allocator = Arc::new(PortAllocator::new(
        config.backend_port_min,
        config.backend_port_max,
        bind_ip,
    ));
    let pool = Arc::new(BackendPool::new(
        config.clone(),
        registry.clone(),
        port_allocator.clone(),
    ));

    let peer = if config.peer_enabled {
        match PeerService::new(config.clone()) {
            Ok(svc) => {
                if let Err(e) = svc.advertise() {
                    warn!("failed to advertise mDNS presence: {e}");
                }
                Some(Arc::new(svc))
            }
            Err(e) => {
                warn!("failed to start peer service: {e}");
                None
            }
        }
    } else {
        None
    };

    let content_index = Arc::new(RwLock::new(content_index));

    let state = AppState {
        config: config.clone(),
        registry,
        pool: pool.clone(),
        content_index: content_index.clone(),
        peer: peer.clone(),
        started_at: Instant::now(),
    };

    let cancel = CancellationToken::new();
    spawn_idle_reaper(pool.clone(), config.clone(), cancel.clone());
    if let Some(peer) = peer.clone() {
        let peer_cancel = cancel.clone();
        tokio::spawn(async move { peer.run(peer_cancel).await });
    }

    let app = build_app_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "modelproxy listening");

    // The blob router is bound on its own listener at `resolved_peer_port`
    // — the port mDNS advertises — only when peer discovery is enabled.
    // Serving it off the same listener as the app router would leave every
    // peer's `/blob/<hash>` fetch connection-refused whenever the two ports
    // differ, which is the documented default.
    let blob_task = if config.peer_enabled {
        let blob_addr = format!("{}:{}", config.host, config.resolved_peer_port());
        let blob_listener = tokio::net::TcpListener::bind(&blob_addr)
            .await
            .with_context(|| format!("failed to bind blob listener at {blob_addr}"))?;
        info!(addr = blob_addr, "blob transfer listening");
        let blob_app = build_blob_router(content_index);
        let blob_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            axum::serve(blob_listener, blob_app)
                .with_graceful_shutdown(async move { blob_cancel.cancelled().await })
                .await
        }))
    } else {
        None
    };

    let shutdown = shutdown_signal();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    cancel.cancel();
    if let Some(task) = blob_task {
        let _ = task.await;
    }
    pool.stop_all().await;
    let _ = PresenceRecord::clear(&presence_path);
    let _ = presence;

    match serve_result {
        Ok(()) => {
            info!("modelproxy shut down cleanly");
            Ok(0)
        }
        Err(e) => {
            error!("server error: {e}");
            Ok(2)
        }
    }
}

fn spawn_idle_reaper(pool: Arc<BackendPool>, config: Arc<ProxyConfig>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let sweep_period = std::cmp::min(config.idle_timeout() / 4, Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("idle reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(sweep_period) => {
                    pool.reap_idle(config.idle_timeout()).await;
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {e}");
        }
        info!("received SIGINT, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM, shutting down");
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .with_env_filter(filter)
        .init();
}
