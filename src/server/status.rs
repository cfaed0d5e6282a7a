//! Status surface: each client gets one JSON line describing the node

use super::{RequestServer, ServerError};
use crate::directory::PeerAddress;
use crate::p2p::{sorted_snapshot, PeerState, PeerStates};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub address: PeerAddress,
    pub state: PeerState,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Local peer ID
    pub peer_id: String,
    pub generated_at: DateTime<Utc>,

    /// Peers alive or being pinged
    pub connected: usize,
    pub peers: Vec<PeerStatus>,
}

impl NodeStatus {
    pub fn collect(peer_id: &str, states: &PeerStates) -> Self {
        let peers: Vec<PeerStatus> = sorted_snapshot(states)
            .into_iter()
            .map(|(address, record)| PeerStatus {
                address,
                state: record.state,
                updated_at: record.updated_at,
            })
            .collect();

        let connected = peers
            .iter()
            .filter(|p| matches!(p.state, PeerState::Alive | PeerState::Pinging))
            .count();

        Self {
            peer_id: peer_id.to_string(),
            generated_at: Utc::now(),
            connected,
            peers,
        }
    }
}

pub struct StatusServer {
    peer_id: String,
    states: PeerStates,
}

impl StatusServer {
    pub fn new(peer_id: impl Into<String>, states: PeerStates) -> Self {
        Self {
            peer_id: peer_id.into(),
            states,
        }
    }
}

#[async_trait]
impl<W> RequestServer<W> for StatusServer
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn attach(&self, mut client: W) -> Result<(), ServerError> {
        let status = NodeStatus::collect(&self.peer_id, &self.states);
        let mut line = serde_json::to_vec(&status).map_err(|e| ServerError::Attach(e.to_string()))?;
        line.push(b'\n');

        client.write_all(&line).await?;
        client.shutdown().await?;
        Ok(())
    }
}
