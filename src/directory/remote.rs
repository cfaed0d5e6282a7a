//! Fetches the bootstrap peer list from the gateway API

use super::{DirectoryError, PeerAddress};
use reqwest::Client;
use std::time::Duration;

/// HTTP source returning a JSON array of peer addresses
#[derive(Clone)]
pub struct HttpPeerSource {
    client: Client,
    peers_url: String,
    transport_marker: String,
}

impl HttpPeerSource {
    pub fn new(
        peers_url: impl Into<String>,
        transport_marker: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            peers_url: peers_url.into(),
            transport_marker: transport_marker.into(),
        })
    }

    pub fn peers_url(&self) -> &str {
        &self.peers_url
    }

    /// Fetch and filter the list. Any network, status or decoding problem is
    /// reported as `Unavailable`.
    pub async fn fetch(&self) -> Result<Vec<PeerAddress>, DirectoryError> {
        let response = self
            .client
            .get(&self.peers_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DirectoryError::Unavailable(format!("Failed to fetch peer list: {}", e)))?;

        let raw: Vec<String> = response
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("Invalid peer list: {}", e)))?;

        let peers = filter_supported(raw, &self.transport_marker);
        tracing::debug!("Peer list from {} has {} usable entries", self.peers_url, peers.len());
        Ok(peers)
    }
}

/// Keep only addresses containing the transport marker, preserving order
pub fn filter_supported(raw: Vec<String>, marker: &str) -> Vec<PeerAddress> {
    raw.into_iter()
        .map(PeerAddress::new)
        .filter(|addr| addr.uses_transport(marker))
        .collect()
}
