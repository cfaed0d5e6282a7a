//! Narrow seam over the peer-to-peer stack

use super::TransportError;
use crate::directory::PeerAddress;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Content identifier of a block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named link from a structured node to a child block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagLink {
    pub name: String,
    pub cid: ContentId,
}

/// Decoded block content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeValue {
    /// Structured node referencing other blocks
    Linked(Vec<DagLink>),

    /// Opaque bytes
    Data(Vec<u8>),
}

/// Operations the connection manager and monitor need from the node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Liveness ping; dials first if needed. Returns the round-trip time.
    async fn probe(&self, addr: &PeerAddress) -> Result<Duration, TransportError>;

    /// Establish a connection, bounded by `timeout` when given
    async fn connect(
        &self,
        addr: &PeerAddress,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, addr: &PeerAddress) -> Result<(), TransportError>;

    /// Addresses of currently known peers
    async fn list_peers(&self) -> Result<Vec<PeerAddress>, TransportError>;

    /// Blocks the given peer is currently trying to retrieve
    async fn want_list(
        &self,
        peer_id: &str,
        timeout: Duration,
    ) -> Result<Vec<ContentId>, TransportError>;

    async fn fetch_node(&self, cid: &ContentId) -> Result<NodeValue, TransportError>;
}
