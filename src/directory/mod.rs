//! Bootstrap peer directory
//!
//! Loads the list of gateway peers this node should stay connected to. The
//! list is cached locally so a restart can dial immediately, and refreshed
//! from the API in the background.

mod cache;
mod remote;

pub use cache::PeerCache;
pub use remote::{filter_supported, HttpPeerSource};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Peer directory unavailable: {0}")]
    Unavailable(String),

    #[error("Peer directory is empty")]
    Empty,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport-specific address of a peer, kept as an opaque string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing path segment of the address, which is the peer id for
    /// `/p2p/<id>` terminated addresses
    pub fn peer_id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Whether the address goes through the given transport marker (e.g. `/wss/`)
    pub fn uses_transport(&self, marker: &str) -> bool {
        self.0.contains(marker)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Ordered list of bootstrap peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerDirectory {
    peers: Vec<PeerAddress>,
}

impl PeerDirectory {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter()
    }

    pub fn as_slice(&self) -> &[PeerAddress] {
        &self.peers
    }
}

impl From<Vec<PeerAddress>> for PeerDirectory {
    fn from(peers: Vec<PeerAddress>) -> Self {
        Self::new(peers)
    }
}

/// Where bootstrap peers come from and where they are persisted
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Peers cached by a previous run, if any
    async fn load(&self) -> Result<Option<Vec<PeerAddress>>, DirectoryError>;

    /// Fresh list from the network, already filtered to supported transports
    async fn fetch(&self) -> Result<Vec<PeerAddress>, DirectoryError>;

    /// Persist the list for the next startup
    async fn save(&self, peers: &[PeerAddress]) -> Result<(), DirectoryError>;
}

/// Cache + HTTP source used by the daemon
pub struct BootstrapDirectory {
    cache: PeerCache,
    remote: HttpPeerSource,
}

impl BootstrapDirectory {
    pub fn new(cache: PeerCache, remote: HttpPeerSource) -> Self {
        Self { cache, remote }
    }
}

#[async_trait]
impl DirectorySource for BootstrapDirectory {
    async fn load(&self) -> Result<Option<Vec<PeerAddress>>, DirectoryError> {
        self.cache.load_peers()
    }

    async fn fetch(&self) -> Result<Vec<PeerAddress>, DirectoryError> {
        self.remote.fetch().await
    }

    async fn save(&self, peers: &[PeerAddress]) -> Result<(), DirectoryError> {
        self.cache.save_peers(peers)
    }
}

/// Outcome of startup resolution
pub struct Resolved {
    pub directory: PeerDirectory,

    /// Background refresh, present when the cached list was used
    pub refresh: Option<JoinHandle<()>>,
}

/// Decide which peers to dial at startup.
///
/// A cached list is used right away while a fresh copy is fetched and saved
/// in the background. Without a usable cache the fetch is awaited and its
/// failure is fatal. An empty result is always fatal. Cache read and write
/// errors only degrade to a fetch or a missing cache on the next start.
pub async fn resolve(source: Arc<dyn DirectorySource>) -> Result<Resolved, DirectoryError> {
    let cached = match source.load().await {
        Ok(cached) => cached.filter(|peers| !peers.is_empty()),
        Err(e) => {
            tracing::warn!("Ignoring unreadable peer cache: {}", e);
            None
        }
    };

    let (peers, refresh) = match cached {
        Some(peers) => {
            tracing::info!("Using {} cached bootstrap peers", peers.len());
            let refresh = tokio::spawn(refresh_in_background(source.clone()));
            (peers, Some(refresh))
        }
        None => {
            let peers = source.fetch().await?;
            tracing::info!("Fetched {} bootstrap peers", peers.len());
            if let Err(e) = source.save(&peers).await {
                tracing::warn!("Failed to cache peer list: {}", e);
            }
            (peers, None)
        }
    };

    if peers.is_empty() {
        return Err(DirectoryError::Empty);
    }

    Ok(Resolved {
        directory: PeerDirectory::new(peers),
        refresh,
    })
}

async fn refresh_in_background(source: Arc<dyn DirectorySource>) {
    match source.fetch().await {
        Ok(peers) => match source.save(&peers).await {
            Ok(()) => tracing::debug!("Refreshed cached peer list ({} peers)", peers.len()),
            Err(e) => tracing::warn!("Failed to cache refreshed peer list: {}", e),
        },
        Err(e) => tracing::warn!("Background peer list refresh failed: {}", e),
    }
}
