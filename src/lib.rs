//! PeerKeeper Core - bootstrap connection keeper for a P2P node
//!
//! Fetches and caches a list of bootstrap peers, dials each of them over
//! libp2p, keeps the connections alive with periodic pings and reconnects
//! peers whose keepalive times out. A diagnostic monitor can log which
//! blocks connected peers are asking for.

pub mod config;
pub mod directory;
pub mod p2p;
pub mod server;

pub use config::{ConfigError, PeerKeeperConfig};

use directory::{DirectoryError, DirectorySource, PeerDirectory, Resolved};
use p2p::{monitor_enabled_for, BlockRequestMonitor, ConnectionManager, NodeTransport, TransportError};
use server::ServerError;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Main error type for PeerKeeper operations
#[derive(Error, Debug)]
pub enum PeerKeeperError {
    #[error("Peer directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Client server error: {0}")]
    Server(#[from] ServerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeerKeeperError>;

/// A running node: resolved directory, per-peer connect sequences and the
/// optional block-request monitor
pub struct PeerKeeperNode {
    config: PeerKeeperConfig,
    transport: Arc<dyn NodeTransport>,
    directory: PeerDirectory,
    connections: ConnectionManager,
    monitor: BlockRequestMonitor,
    refresh: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerKeeperNode {
    /// Resolve the bootstrap directory and start dialing it.
    ///
    /// Nothing is sent to the transport when no peers can be resolved.
    pub async fn bootstrap(
        config: PeerKeeperConfig,
        source: Arc<dyn DirectorySource>,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        let resolved = directory::resolve(source).await?;
        Ok(Self::start(config, resolved, transport))
    }

    /// Start connect sequences for an already resolved directory
    pub fn start(config: PeerKeeperConfig, resolved: Resolved, transport: Arc<dyn NodeTransport>) -> Self {
        let Resolved { directory, refresh } = resolved;

        let connections = ConnectionManager::new(transport.clone(), config.keepalive_timing());
        connections.connect_all(&directory);

        let mut monitor = BlockRequestMonitor::new(transport.clone(), config.monitor_config());
        match config.monitor_host() {
            Some(host) if monitor_enabled_for(&host, &config.monitor_hosts) => {
                tracing::info!("Block request monitor enabled on {}", host);
                monitor.start();
            }
            host => tracing::debug!("Block request monitor disabled (host {:?})", host),
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!("PeerKeeper node started with {} bootstrap peers", directory.len());

        Self {
            config,
            transport,
            directory,
            connections,
            monitor,
            refresh,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &PeerKeeperConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn NodeTransport> {
        self.transport.clone()
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.is_running()
    }

    /// Receiver notified once when the node shuts down
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every task owned by the node
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.connections.shutdown();
        self.monitor.stop();
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        tracing::info!("PeerKeeper node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{filter_supported, PeerAddress, PeerCache};
    use crate::p2p::mock::{MockTransport, Reply};
    use crate::p2p::PeerState;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    const PEER_A: &str = "/ip4/1.2.3.4/tcp/4001/wss/p2p/PeerA";
    const PEER_B: &str = "/ip4/5.6.7.8/tcp/4001/wss/p2p/PeerB";

    /// Cache on disk, fetch from a fixed raw list
    struct MemorySource {
        cache: PeerCache,
        raw: Vec<String>,
    }

    #[async_trait]
    impl DirectorySource for MemorySource {
        async fn load(&self) -> std::result::Result<Option<Vec<PeerAddress>>, DirectoryError> {
            self.cache.load_peers()
        }

        async fn fetch(&self) -> std::result::Result<Vec<PeerAddress>, DirectoryError> {
            Ok(filter_supported(self.raw.clone(), "/wss/"))
        }

        async fn save(&self, peers: &[PeerAddress]) -> std::result::Result<(), DirectoryError> {
            self.cache.save_peers(peers)
        }
    }

    fn config(host: &str) -> PeerKeeperConfig {
        PeerKeeperConfig {
            host_name: Some(host.to_string()),
            ..PeerKeeperConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_directory_fails_before_dialing() {
        let dir = tempdir().unwrap();
        let source = Arc::new(MemorySource {
            cache: PeerCache::open(dir.path()).unwrap(),
            raw: vec!["/ip4/9.9.9.9/tcp/4001/p2p/NoWss".to_string()],
        });
        let transport = Arc::new(MockTransport::new());

        let result = PeerKeeperNode::bootstrap(config("example.org"), source, transport.clone()).await;

        assert!(matches!(
            result,
            Err(PeerKeeperError::Directory(DirectoryError::Empty))
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_connects_and_persists() {
        let dir = tempdir().unwrap();
        let cache = PeerCache::open(dir.path()).unwrap();
        let raw = vec![
            PEER_A.to_string(),
            "/ip4/1.2.3.4/tcp/4001/p2p/PeerTcpOnly".to_string(),
            PEER_B.to_string(),
        ];
        let source = Arc::new(MemorySource {
            cache: cache.clone(),
            raw: raw.clone(),
        });

        let transport = Arc::new(MockTransport::new());
        transport.script_probes(PEER_B, vec![Reply::Fail]);

        let mut node = PeerKeeperNode::bootstrap(config("example.org"), source, transport.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let a = PeerAddress::from(PEER_A);
        let b = PeerAddress::from(PEER_B);
        assert_eq!(node.connections().state(&a), Some(PeerState::Alive));
        assert_eq!(node.connections().state(&b), Some(PeerState::Failed));
        assert_eq!(node.connections().connected_count(), 1);
        assert_eq!(node.directory().len(), 2);

        let saved = cache.load_peers().unwrap().unwrap();
        assert_eq!(saved, filter_supported(raw, "/wss/"));

        assert!(!node.monitor_running());
        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_runs_on_allowed_host() {
        let dir = tempdir().unwrap();
        let source = Arc::new(MemorySource {
            cache: PeerCache::open(dir.path()).unwrap(),
            raw: vec![PEER_A.to_string()],
        });
        let transport = Arc::new(MockTransport::new());

        let mut node = PeerKeeperNode::bootstrap(config("localhost"), source, transport)
            .await
            .unwrap();
        let mut shutdown_rx = node.subscribe_shutdown();
        assert!(node.monitor_running());

        node.shutdown();
        assert!(!node.monitor_running());
        assert!(shutdown_rx.recv().await.is_ok());
    }
}
