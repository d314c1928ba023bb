//! Persistent Presence — a `presence.json` record (`pid`, `host`, `port`,
//! `started_at`) that lets a newly-launched proxy detect a still-running
//! instance before binding, and lets clients short-circuit a stale record
//! left behind by a crash.

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Deadline for the liveness HTTP probe — short enough that a genuinely
/// hung process reads as dead quickly, long enough to tolerate normal
/// scheduling jitter on a loaded box.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl PresenceRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            pid: std::process::id(),
            host: host.into(),
            port,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self).expect("presence serialization cannot fail");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)
    }

    pub fn clear(path: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Check whether the pid recorded in this presence file still refers
    /// to a live process. On Unix this sends signal 0, which performs
    /// existence/permission checks without affecting the target.
    #[cfg(unix)]
    pub fn is_process_alive(&self) -> bool {
        unsafe { libc::kill(self.pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    pub fn is_process_alive(&self) -> bool {
        true
    }
}

/// Verify no other instance is running, or fail with `AlreadyRunning`.
/// A record is only treated as live when BOTH its pid still exists AND its
/// `host:port`'s `/health` answers within [`HEALTH_PROBE_TIMEOUT`] — pid
/// liveness alone cannot distinguish a healthy instance from a hung one
/// holding a recycled pid, so a record failing the health probe is treated
/// as stale and silently cleared, same as a dead pid.
pub async fn check_and_claim(path: &Path, host: &str, port: u16) -> ProxyResult<PresenceRecord> {
    if let Some(existing) = PresenceRecord::load(path) {
        if existing.is_process_alive() && probe_health(&existing.host, existing.port).await {
            return Err(ProxyError::AlreadyRunning {
                host: existing.host,
                port: existing.port,
                pid: existing.pid,
            });
        }
        tracing::warn!(
            pid = existing.pid,
            path = %path.display(),
            "stale presence record found, clearing"
        );
    }

    let record = PresenceRecord::new(host, port);
    record.write(path)?;
    Ok(record)
}

/// Probe `http://host:port/health`, returning `true` only on a fast 2xx.
async fn probe_health(host: &str, port: u16) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(HEALTH_PROBE_TIMEOUT).build() else {
        return false;
    };
    let url = format!("http://{host}:{port}/health");
    matches!(client.get(&url).send().await, Ok(resp) if resp.status().is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("presence.json");
        let record = PresenceRecord::new("127.0.0.1", 11313);
        record.write(&path).unwrap();

        let loaded = PresenceRecord::load(&path).unwrap();
        assert_eq!(loaded.pid, record.pid);
        assert_eq!(loaded.port, 11313);
    }

    async fn serve_health_ok(listener: tokio::net::TcpListener) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            });
        }
    }

    #[tokio::test]
    async fn claim_succeeds_when_no_presence_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("presence.json");
        let record = check_and_claim(&path, "127.0.0.1", 11313).await.unwrap();
        assert_eq!(record.port, 11313);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn claim_fails_when_live_process_has_healthy_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_health_ok(listener));

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("presence.json");
        // Our own pid is always alive, and the fake server above answers
        // /health, so this record must be treated as genuinely live.
        let record = PresenceRecord::new(addr.ip().to_string(), addr.port());
        record.write(&path).unwrap();

        match check_and_claim(&path, "127.0.0.1", 11314).await {
            Err(ProxyError::AlreadyRunning { port, .. }) => assert_eq!(port, addr.port()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_clears_presence_with_live_pid_but_unresponsive_health() {
        // Our own pid is alive, but nothing listens on this port, so the
        // health probe fails — a hung process (or stale/recycled pid) must
        // not permanently block future startups.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("presence.json");
        let stuck = PresenceRecord::new("127.0.0.1", 1);
        stuck.write(&path).unwrap();

        let record = check_and_claim(&path, "127.0.0.1", 11316).await.unwrap();
        assert_eq!(record.port, 11316);
    }

    #[tokio::test]
    async fn claim_clears_stale_presence_from_dead_pid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("presence.json");
        let stale = PresenceRecord {
            pid: 999_999, // unlikely to be a live pid in any test environment
            host: "127.0.0.1".into(),
            port: 11313,
            started_at: chrono::Utc::now(),
        };
        stale.write(&path).unwrap();

        let record = check_and_claim(&path, "127.0.0.1", 11315).await.unwrap();
        assert_eq!(record.port, 11315);
    }

    #[test]
    fn clear_removes_presence_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("presence.json");
        PresenceRecord::new("127.0.0.1", 11313).write(&path).unwrap();
        PresenceRecord::clear(&path).unwrap();
        assert!(!path.exists());
    }
}
