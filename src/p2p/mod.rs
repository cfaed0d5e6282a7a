//! P2P Networking Module using libp2p
//!
//! Dials the bootstrap peers, keeps those connections alive and optionally
//! watches which blocks the peers ask for.

mod connection;
mod monitor;
mod node;
mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{sorted_snapshot, ConnectionManager, KeepaliveTiming, PeerRecord, PeerState, PeerStates};
pub use monitor::{monitor_enabled_for, BlockRequestMonitor, MonitorConfig, RequestLedger, Sighting};
pub use node::{load_or_generate_keypair, Libp2pTransport, P2PNodeConfig};
pub use transport::{ContentId, DagLink, NodeTransport, NodeValue};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to initialize network: {0}")]
    InitializationFailed(String),

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Ping failed: {0}")]
    PingFailed(String),

    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Not supported by this transport: {0}")]
    Unsupported(&'static str),

    #[error("Node stopped")]
    Stopped,

    #[error("Timeout")]
    Timeout,
}
