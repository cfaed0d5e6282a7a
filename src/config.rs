//! Node configuration
//!
//! Loaded from a JSON file with env var overrides. Missing fields fall back
//! to their defaults.

use crate::p2p::{KeepaliveTiming, MonitorConfig, P2PNodeConfig};

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid listen address {0}")]
    InvalidListenAddress(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerKeeperConfig {
    // Directory
    /// Base URL of the API serving the bootstrap list
    pub api_endpoint: String,
    /// Path of the bootstrap list below `api_endpoint`
    pub peers_path: String,
    /// Only addresses containing this are dialed
    pub transport_marker: String,
    /// Directory holding the peer cache and node key
    pub data_path: String,
    pub fetch_timeout_secs: u64,

    // Connections
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub idle_connection_timeout_secs: u64,
    /// libp2p listen multiaddrs (empty: dial only)
    pub listen_addresses: Vec<String>,

    // Clients
    /// TCP address of the status socket
    pub ipc_address: String,
    pub client_queue_capacity: usize,

    // Monitor
    /// Host this node runs as. Falls back to the host of `api_endpoint`.
    pub host_name: Option<String>,
    /// Hosts on which the block-request monitor runs
    pub monitor_hosts: Vec<String>,
    pub monitor_poll_interval_ms: u64,
    pub want_list_timeout_secs: u64,
    pub monitor_fetch_timeout_secs: u64,
    pub monitor_verbose: bool,
    pub monitor_seen_capacity: usize,
}

impl Default for PeerKeeperConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://runfission.com".to_string(),
            peers_path: "/ipfs/peers".to_string(),
            transport_marker: "/wss/".to_string(),
            data_path: "./peerkeeper-data".to_string(),
            fetch_timeout_secs: 30,
            connect_timeout_secs: 15,
            keepalive_interval_secs: 60,
            keepalive_timeout_secs: 30,
            ping_interval_secs: 15,
            idle_connection_timeout_secs: 300,
            listen_addresses: Vec::new(),
            ipc_address: "127.0.0.1:4466".to_string(),
            client_queue_capacity: 64,
            host_name: None,
            monitor_hosts: vec!["localhost".to_string(), "auth.runfission.net".to_string()],
            monitor_poll_interval_ms: 20,
            want_list_timeout_secs: 120,
            monitor_fetch_timeout_secs: 30,
            monitor_verbose: false,
            monitor_seen_capacity: 10_000,
        }
    }
}

impl PeerKeeperConfig {
    /// Config file location: `PEERKEEPER_CONFIG`, else `{data_path}/config.json`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("PEERKEEPER_CONFIG") {
            return PathBuf::from(path);
        }
        let data_path = std::env::var("PEERKEEPER_DATA_PATH").unwrap_or_else(|_| Self::default().data_path);
        Path::new(&data_path).join(CONFIG_FILE_NAME)
    }

    /// Load config from `path` and apply env overrides.
    /// A missing file yields defaults; a corrupt one is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let config = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!("Loaded config from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("PEERKEEPER_API_ENDPOINT") {
            debug!("PEERKEEPER_API_ENDPOINT={}", val);
            self.api_endpoint = val;
        }
        if let Some(val) = lookup("PEERKEEPER_DATA_PATH") {
            debug!("PEERKEEPER_DATA_PATH={}", val);
            self.data_path = val;
        }
        if let Some(val) = lookup("PEERKEEPER_HOST") {
            debug!("PEERKEEPER_HOST={}", val);
            self.host_name = Some(val);
        }
        if let Some(val) = lookup("PEERKEEPER_MONITOR_VERBOSE") {
            self.monitor_verbose = matches!(val.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn peers_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_endpoint.trim_end_matches('/'),
            self.peers_path.trim_start_matches('/')
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Host used to decide whether the monitor runs
    pub fn monitor_host(&self) -> Option<String> {
        if let Some(host) = &self.host_name {
            return Some(host.clone());
        }
        reqwest::Url::parse(&self.api_endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    pub fn keepalive_timing(&self) -> KeepaliveTiming {
        KeepaliveTiming {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            interval: Duration::from_secs(self.keepalive_interval_secs),
            ping_timeout: Duration::from_secs(self.keepalive_timeout_secs),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.monitor_poll_interval_ms),
            want_list_timeout: Duration::from_secs(self.want_list_timeout_secs),
            fetch_timeout: Duration::from_secs(self.monitor_fetch_timeout_secs),
            verbose: self.monitor_verbose,
            seen_capacity: self.monitor_seen_capacity,
        }
    }

    pub fn node_config(&self) -> Result<P2PNodeConfig, ConfigError> {
        let listen_addresses = self
            .listen_addresses
            .iter()
            .map(|addr| {
                addr.parse::<Multiaddr>()
                    .map_err(|_| ConfigError::InvalidListenAddress(addr.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(P2PNodeConfig {
            listen_addresses,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_connection_timeout: Duration::from_secs(self.idle_connection_timeout_secs),
            ..P2PNodeConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PeerKeeperConfig::default();
        assert_eq!(config.peers_url(), "https://runfission.com/ipfs/peers");
        assert_eq!(config.keepalive_timing(), KeepaliveTiming::default());
        assert_eq!(config.monitor_config().poll_interval, Duration::from_millis(20));
        assert_eq!(config.monitor_config().seen_capacity, 10_000);
        assert_eq!(config.monitor_config().fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = PeerKeeperConfig::read_file(&dir.path().join("nonexistent.json")).unwrap();
        assert_eq!(config, PeerKeeperConfig::default());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"api_endpoint": "http://localhost:3000/", "keepalive_interval_secs": 5}"#).unwrap();

        let config = PeerKeeperConfig::read_file(&path).unwrap();
        assert_eq!(config.keepalive_interval_secs, 5);
        assert_eq!(config.keepalive_timeout_secs, 30);
        assert_eq!(config.peers_url(), "http://localhost:3000/ipfs/peers");
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "not json {{{").unwrap();

        assert!(matches!(PeerKeeperConfig::read_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PEERKEEPER_API_ENDPOINT", "http://localhost:8080"),
            ("PEERKEEPER_HOST", "localhost"),
            ("PEERKEEPER_MONITOR_VERBOSE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = PeerKeeperConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api_endpoint, "http://localhost:8080");
        assert_eq!(config.host_name.as_deref(), Some("localhost"));
        assert!(config.monitor_verbose);
        assert_eq!(config.data_path, PeerKeeperConfig::default().data_path);
    }

    #[test]
    fn test_monitor_host_falls_back_to_endpoint() {
        let mut config = PeerKeeperConfig::default();
        config.api_endpoint = "https://auth.runfission.net/api".to_string();
        assert_eq!(config.monitor_host().as_deref(), Some("auth.runfission.net"));

        config.host_name = Some("localhost".to_string());
        assert_eq!(config.monitor_host().as_deref(), Some("localhost"));
    }

    #[test]
    fn test_node_config_parses_listen_addresses() {
        let mut config = PeerKeeperConfig::default();
        config.listen_addresses = vec!["/ip4/0.0.0.0/tcp/4001".to_string()];
        let node = config.node_config().unwrap();
        assert_eq!(node.listen_addresses.len(), 1);
        assert_eq!(node.idle_connection_timeout, Duration::from_secs(300));

        config.listen_addresses.push("not-a-multiaddr".to_string());
        assert!(matches!(config.node_config(), Err(ConfigError::InvalidListenAddress(_))));
    }
}
