//! Proxy configuration loading and parsing.
//!
//! Mirrors the structure of `aiOS`'s `config.toml` reader, but the proxy
//! reads YAML (`config.yaml`, per the persistent state layout) with the
//! same "every field optional, defaults baked in" idiom.

#![allow(dead_code)]

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_models")]
    pub max_models: usize,
    #[serde(default = "default_idle_timeout_mins")]
    pub idle_timeout_mins: u64,
    #[serde(default = "default_backend_port_min")]
    pub backend_port_min: u16,
    #[serde(default = "default_backend_port_max")]
    pub backend_port_max: u16,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_admission_wait_secs")]
    pub admission_wait_secs: u64,
    #[serde(default)]
    pub peer_enabled: bool,
    pub peer_port: Option<u16>,
    pub child_executable_path: Option<String>,
    #[serde(default = "default_models_root")]
    pub models_root: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_service_tag")]
    pub service_tag: String,
    pub log_file: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_log_rotation_max_size_mb")]
    pub log_rotation_max_size_mb: u64,
    #[serde(default = "default_log_rotation_keep_files")]
    pub log_rotation_keep_files: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_models: default_max_models(),
            idle_timeout_mins: default_idle_timeout_mins(),
            backend_port_min: default_backend_port_min(),
            backend_port_max: default_backend_port_max(),
            startup_timeout_secs: default_startup_timeout_secs(),
            admission_wait_secs: default_admission_wait_secs(),
            peer_enabled: false,
            peer_port: None,
            child_executable_path: None,
            models_root: default_models_root(),
            state_dir: default_state_dir(),
            service_tag: default_service_tag(),
            log_file: None,
            max_body_bytes: default_max_body_bytes(),
            stop_grace_secs: default_stop_grace_secs(),
            log_rotation_max_size_mb: default_log_rotation_max_size_mb(),
            log_rotation_keep_files: default_log_rotation_keep_files(),
        }
    }
}

impl ProxyConfig {
    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_mins * 60)
    }

    pub fn startup_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn admission_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.admission_wait_secs)
    }

    pub fn stop_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stop_grace_secs)
    }

    pub fn resolved_peer_port(&self) -> u16 {
        self.peer_port.unwrap_or(self.port + 1)
    }

    pub fn models_root_path(&self) -> PathBuf {
        PathBuf::from(&self.models_root)
    }

    pub fn state_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    pub fn presence_path(&self) -> PathBuf {
        self.state_dir_path().join("presence.json")
    }

    pub fn content_index_path(&self) -> PathBuf {
        self.state_dir_path().join("content_index.json")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.state_dir_path().join("bin")
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    11313
}
fn default_max_models() -> usize {
    3
}
fn default_idle_timeout_mins() -> u64 {
    10
}
fn default_backend_port_min() -> u16 {
    49152
}
fn default_backend_port_max() -> u16 {
    49200
}
fn default_startup_timeout_secs() -> u64 {
    120
}
fn default_admission_wait_secs() -> u64 {
    30
}
fn default_models_root() -> String {
    default_state_dir_string() + "/models"
}
fn default_state_dir() -> String {
    default_state_dir_string()
}
fn default_service_tag() -> String {
    "modelproxy".into()
}
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_stop_grace_secs() -> u64 {
    10
}
fn default_log_rotation_max_size_mb() -> u64 {
    100
}
fn default_log_rotation_keep_files() -> u32 {
    10
}

fn default_state_dir_string() -> String {
    dirs::home_dir()
        .map(|h| h.join(".modelproxy").to_string_lossy().to_string())
        .unwrap_or_else(|| "/var/lib/modelproxy".to_string())
}

/// Load configuration from the path named by `MODELPROXY_CONFIG`, defaulting
/// to `~/.modelproxy/config.yaml`. Falls back to baked-in defaults when the
/// file is absent, logging a warning — the same shape as
/// `aios_init::config::load_config`.
pub fn load_config() -> Result<ProxyConfig> {
    let config_path = std::env::var("MODELPROXY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".modelproxy")
                .join("config.yaml")
        });

    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<ProxyConfig> {
    if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config from {}", config_path.display()))?;
        let config: ProxyConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", config_path.display()))?;
        Ok(config)
    } else {
        tracing::warn!(path = %config_path.display(), "config file not found, using defaults");
        Ok(ProxyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec() {
        let c = ProxyConfig::default();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 11313);
        assert_eq!(c.max_models, 3);
        assert_eq!(c.idle_timeout_mins, 10);
        assert_eq!(c.backend_port_min, 49152);
        assert_eq!(c.backend_port_max, 49200);
        assert_eq!(c.startup_timeout_secs, 120);
        assert_eq!(c.admission_wait_secs, 30);
        assert!(!c.peer_enabled);
    }

    #[test]
    fn resolved_peer_port_defaults_to_port_plus_one() {
        let c = ProxyConfig::default();
        assert_eq!(c.resolved_peer_port(), c.port + 1);
    }

    #[test]
    fn parse_minimal_yaml() {
        let yaml = "host: 0.0.0.0\nmax_models: 5\n";
        let c: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.max_models, 5);
        assert_eq!(c.port, 11313); // default still applies
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
host: 0.0.0.0
port: 9000
max_models: 2
idle_timeout_mins: 20
backend_port_min: 40000
backend_port_max: 40010
startup_timeout_secs: 60
admission_wait_secs: 15
peer_enabled: true
peer_port: 9001
"#;
        let c: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.backend_port_max, 40010);
        assert!(c.peer_enabled);
        assert_eq!(c.resolved_peer_port(), 9001);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let c = load_config_from(Path::new("/nonexistent/modelproxy/config.yaml")).unwrap();
        assert_eq!(c.port, default_port());
    }
}
