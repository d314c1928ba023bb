//! Backend Supervisor — owns the lifecycle of a single backend child
//! process: spawn, liveness polling, request forwarding with byte-for-byte
//! streaming passthrough, and graceful-then-forced shutdown.
//!
//! The spawn/health/stop pattern is carried over from the runtime crate's
//! process supervision, generalized from a single hardcoded binary to the
//! configurable `child_executable_path` this proxy resolves per model.

use crate::child_log;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::registry::ResolvedModel;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Recognized spawn overlay keys (`ctx-size`, `gpu-layers`, `threads`) plus
/// any opaque passthrough keys, applied over the base spawn args. Mirrors
/// the wire shape of `/api/run`'s `options` field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnOpts {
    #[serde(default)]
    pub ctx_size: Option<u64>,
    #[serde(default)]
    pub gpu_layers: Option<u64>,
    #[serde(default)]
    pub threads: Option<u64>,
    #[serde(flatten)]
    pub passthrough: HashMap<String, serde_json::Value>,
}

impl SpawnOpts {
    /// Render as llama.cpp-style dashed CLI flags: `--ctx-size`,
    /// `--gpu-layers`, `--threads`, then one `--<key> <value>` pair per
    /// passthrough entry, in insertion order. A passthrough key colliding
    /// with a recognized one is skipped — the typed field already won.
    fn cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(v) = self.ctx_size {
            args.push("--ctx-size".to_string());
            args.push(v.to_string());
        }
        if let Some(v) = self.gpu_layers {
            args.push("--gpu-layers".to_string());
            args.push(v.to_string());
        }
        if let Some(v) = self.threads {
            args.push("--threads".to_string());
            args.push(v.to_string());
        }
        for (key, value) in &self.passthrough {
            if matches!(key.as_str(), "ctx_size" | "gpu_layers" | "threads") {
                continue;
            }
            args.push(format!("--{}", key.replace('_', "-")));
            args.push(scalar_to_string(value));
        }
        args
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A running (or starting) backend process bound to one port.
pub struct Backend {
    pub model: ResolvedModel,
    pub port: u16,
    child: tokio::sync::Mutex<Option<Child>>,
    http_client: reqwest::Client,
    /// Count of requests currently being forwarded through this backend.
    in_flight: AtomicU32,
    /// Epoch-millis of the last time a request was dispatched to this backend.
    last_used_ms: AtomicI64,
}

impl Backend {
    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_used_ms.store(now_epoch_ms(), Ordering::SeqCst);
    }

    /// Spawn the backend child process with `opts` overlaid onto the base
    /// spawn args, and block until its health endpoint responds or
    /// `startup_timeout` elapses.
    pub async fn start(
        config: &ProxyConfig,
        model: ResolvedModel,
        port: u16,
        opts: &SpawnOpts,
    ) -> ProxyResult<Backend> {
        let executable = resolve_executable(config)?;

        info!(
            model = %model.id,
            port,
            exe = %executable.display(),
            "spawning backend"
        );

        let canonical = model.id.canonical();
        let log_file = child_log::open(
            &config.bin_dir(),
            &canonical,
            config.log_rotation_max_size_mb,
            config.log_rotation_keep_files,
        )
        .map_err(|e| ProxyError::StartupFailure {
            model: canonical.clone(),
            detail: format!("failed to open child log: {e}"),
        })?;
        let stderr_file = log_file.try_clone().map_err(|e| ProxyError::StartupFailure {
            model: canonical.clone(),
            detail: format!("failed to duplicate child log handle: {e}"),
        })?;

        let child = Command::new(&executable)
            .arg("--model")
            .arg(&model.blob_path)
            .arg("--port")
            .arg(port.to_string())
            .arg("--host")
            .arg("127.0.0.1")
            .args(opts.cli_args())
            .kill_on_drop(true)
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| ProxyError::StartupFailure {
                model: model.id.canonical(),
                detail: format!("failed to spawn {}: {e}", executable.display()),
            })?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail");

        let backend = Backend {
            model,
            port,
            child: tokio::sync::Mutex::new(Some(child)),
            http_client,
            in_flight: AtomicU32::new(0),
            last_used_ms: AtomicI64::new(now_epoch_ms()),
        };

        backend.wait_until_healthy(config.startup_timeout()).await?;
        Ok(backend)
    }

    async fn wait_until_healthy(&self, timeout: Duration) -> ProxyResult<()> {
        let deadline = Instant::now() + timeout;
        let health_url = format!("{}/health", self.base_url());

        while Instant::now() < deadline {
            match self.http_client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(model = %self.model.id, port = self.port, "backend healthy");
                    return Ok(());
                }
                _ => {
                    let mut guard = self.child.lock().await;
                    if let Some(ref mut child) = *guard {
                        match child.try_wait() {
                            Ok(Some(status)) => {
                                let detail = format!("process exited early with {status}");
                                error!(model = %self.model.id, "{detail}");
                                return Err(ProxyError::StartupFailure {
                                    model: self.model.id.canonical(),
                                    detail,
                                });
                            }
                            Ok(None) => {}
                            Err(e) => {
                                return Err(ProxyError::StartupFailure {
                                    model: self.model.id.canonical(),
                                    detail: format!("failed to poll child: {e}"),
                                });
                            }
                        }
                    }
                    drop(guard);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        }

        warn!(model = %self.model.id, port = self.port, "backend startup timed out");
        Err(ProxyError::StartupTimeout {
            model: self.model.id.canonical(),
        })
    }

    /// Quick liveness probe, used by the pool's idle reaper and `/api/status`.
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    /// Forward an HTTP request to this backend and stream the response body
    /// back byte-for-byte, with no re-parsing of SSE/JSON chunks. Cancelling
    /// the inbound connection propagates to the outbound request via
    /// `reqwest`'s own drop-cancellation.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Body,
    ) -> ProxyResult<axum::response::Response> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        let result = self.forward_inner(method, path_and_query, headers, body).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn forward_inner(
        &self,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Body,
    ) -> ProxyResult<axum::response::Response> {
        let url = format!("{}{}", self.base_url(), path_and_query);
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ProxyError::BadRequest {
                detail: format!("failed to buffer request body: {e}"),
            })?;

        let mut req = self.http_client.request(method, &url).body(body_bytes);
        for (name, value) in headers.iter() {
            if name == axum::http::header::HOST {
                continue;
            }
            req = req.header(name.clone(), value.clone());
        }

        let upstream = req.send().await.map_err(|e| ProxyError::BackendTransport {
            detail: format!("connection to backend failed: {e}"),
        })?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers().iter() {
            response_headers.insert(name.clone(), value.clone());
        }

        let stream = upstream.bytes_stream();
        let body = Body::from_stream(stream);

        let mut response = axum::response::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    /// Stop this backend. Sends SIGTERM (Unix) and waits up to `grace`
    /// before forcing a kill. Refuses with `BackendTransport` when
    /// `in_flight > 0` unless `force` is set, mirroring the pool's
    /// drain-before-evict contract.
    pub async fn stop(&self, grace: Duration, force: bool) -> ProxyResult<()> {
        if !force && self.in_flight() > 0 {
            return Err(ProxyError::BackendTransport {
                detail: format!("backend for {} has {} in-flight requests", self.model.id, self.in_flight()),
            });
        }

        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                debug!(model = %self.model.id, pid, "sent SIGTERM");
            }

            let deadline = Instant::now() + grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(model = %self.model.id, ?status, "backend exited");
                        break;
                    }
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            warn!(model = %self.model.id, "grace period elapsed, sending SIGKILL");
                            let _ = child.kill().await;
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => {
                        error!(model = %self.model.id, "error waiting for backend: {e}");
                        let _ = child.kill().await;
                        break;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }

        Ok(())
    }
}

fn resolve_executable(config: &ProxyConfig) -> ProxyResult<PathBuf> {
    if let Some(ref configured) = config.child_executable_path {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Ok(path);
        }
        warn!(path = configured, "configured child_executable_path does not exist");
    }

    if let Ok(env_path) = std::env::var("MODELPROXY_CHILD_EXECUTABLE") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Ok(path);
        }
    }

    for candidate in &["/usr/local/bin/llama-server", "/usr/bin/llama-server"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    Err(ProxyError::StartupFailure {
        model: String::new(),
        detail: "no backend executable found: set child_executable_path or MODELPROXY_CHILD_EXECUTABLE".into(),
    })
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_executable_prefers_configured_path_when_present() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut config = ProxyConfig::default();
        config.child_executable_path = Some(tmp.path().to_string_lossy().to_string());
        let resolved = resolve_executable(&config).unwrap();
        assert_eq!(resolved, tmp.path());
    }

    #[test]
    fn resolve_executable_errors_when_nothing_found() {
        let mut config = ProxyConfig::default();
        config.child_executable_path = Some("/nonexistent/binary/path".into());
        std::env::remove_var("MODELPROXY_CHILD_EXECUTABLE");
        let result = resolve_executable(&config);
        // Only assert the error path when no well-known binary exists on the
        // machine running the test, matching this repo's sandboxed CI image.
        if !std::path::Path::new("/usr/local/bin/llama-server").exists()
            && !std::path::Path::new("/usr/bin/llama-server").exists()
        {
            assert!(result.is_err());
        }
    }
}
