//! Per-peer connect and keepalive sequences
//!
//! Every bootstrap peer gets its own task: probe, connect, then ping on a
//! fixed cadence forever, reconnecting whenever a ping goes unanswered. A
//! failure in one peer's task never reaches the caller or any other peer.

use super::NodeTransport;
use crate::directory::{PeerAddress, PeerDirectory};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where a peer's connect sequence currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Probing,
    Connecting,
    Alive,
    Pinging,
    Reconnecting,
    /// Probe or initial connect failed; the sequence has ended
    Failed,
}

/// Latest state of a peer and when it was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub state: PeerState,

    /// Unix timestamp (seconds)
    pub updated_at: i64,
}

/// Shared view of all peer states. Each sequence only writes its own entry.
pub type PeerStates = Arc<DashMap<PeerAddress, PeerRecord>>;

/// Timing of the connect and keepalive cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveTiming {
    /// Bound on the initial connect
    pub connect_timeout: Duration,

    /// Delay between the end of one keepalive check and the next
    pub interval: Duration,

    /// How long a keepalive ping may take before reconnecting
    pub ping_timeout: Duration,
}

impl Default for KeepaliveTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(30),
        }
    }
}

/// Dials every bootstrap peer and keeps the connections alive
pub struct ConnectionManager {
    transport: Arc<dyn NodeTransport>,
    timing: KeepaliveTiming,
    states: PeerStates,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn NodeTransport>, timing: KeepaliveTiming) -> Self {
        Self {
            transport,
            timing,
            states: Arc::new(DashMap::new()),
            tasks: Mutex::new(vec![]),
        }
    }

    /// Start a connect sequence for every peer and return without waiting
    pub fn connect_all(&self, directory: &PeerDirectory) {
        let mut tasks = self.tasks.lock();

        for addr in directory.iter() {
            let sequence = ConnectSequence {
                transport: self.transport.clone(),
                addr: addr.clone(),
                timing: self.timing,
                states: self.states.clone(),
            };
            sequence.set(PeerState::Probing);
            tasks.push(tokio::spawn(sequence.run()));
        }

        tracing::debug!("Dispatched {} connect sequences", directory.len());
    }

    pub fn state(&self, addr: &PeerAddress) -> Option<PeerState> {
        self.states.get(addr).map(|record| record.state)
    }

    pub fn states(&self) -> PeerStates {
        self.states.clone()
    }

    /// All peers with their current record, ordered by address
    pub fn snapshot(&self) -> Vec<(PeerAddress, PeerRecord)> {
        sorted_snapshot(&self.states)
    }

    /// Peers currently connected (alive or being pinged)
    pub fn connected_count(&self) -> usize {
        self.states
            .iter()
            .filter(|entry| matches!(entry.state, PeerState::Alive | PeerState::Pinging))
            .count()
    }

    /// Abort every sequence
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Copy of a state map, ordered by address
pub fn sorted_snapshot(states: &PeerStates) -> Vec<(PeerAddress, PeerRecord)> {
    let mut peers: Vec<_> = states
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect();
    peers.sort_by(|a, b| a.0.cmp(&b.0));
    peers
}

struct ConnectSequence {
    transport: Arc<dyn NodeTransport>,
    addr: PeerAddress,
    timing: KeepaliveTiming,
    states: PeerStates,
}

impl ConnectSequence {
    fn set(&self, state: PeerState) {
        self.states.insert(
            self.addr.clone(),
            PeerRecord {
                state,
                updated_at: chrono::Utc::now().timestamp(),
            },
        );
    }

    async fn run(self) {
        if self.establish().await {
            self.keep_alive().await;
        }
    }

    /// Probe then connect. No retry on failure.
    async fn establish(&self) -> bool {
        if let Err(e) = self.transport.probe(&self.addr).await {
            self.set(PeerState::Failed);
            tracing::info!("Could not connect to {}: {}", self.addr, e);
            return false;
        }

        self.set(PeerState::Connecting);
        if let Err(e) = self
            .transport
            .connect(&self.addr, Some(self.timing.connect_timeout))
            .await
        {
            self.set(PeerState::Failed);
            tracing::info!("Could not connect to {}: {}", self.addr, e);
            return false;
        }

        self.set(PeerState::Alive);
        tracing::info!("Connected to {}", self.addr);
        true
    }

    /// Ping on a fixed cadence. Only an unanswered ping leads to a reconnect;
    /// a rejected ping is ignored. A peer whose reconnect failed stays
    /// `Reconnecting` until a later ping is answered.
    async fn keep_alive(&self) {
        let mut settled = PeerState::Alive;

        loop {
            tokio::time::sleep(self.timing.interval).await;

            self.set(PeerState::Pinging);
            match tokio::time::timeout(self.timing.ping_timeout, self.transport.probe(&self.addr)).await {
                Ok(Ok(rtt)) => {
                    tracing::debug!("Keepalive ping to {} took {:?}", self.addr.peer_id(), rtt);
                    settled = PeerState::Alive;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Keepalive ping to {} rejected: {}", self.addr.peer_id(), e);
                }
                Err(_) => {
                    self.set(PeerState::Reconnecting);
                    tracing::warn!(
                        "No keepalive reply from {} within {:?}, reconnecting",
                        self.addr,
                        self.timing.ping_timeout
                    );
                    settled = if self.reconnect().await {
                        PeerState::Alive
                    } else {
                        PeerState::Reconnecting
                    };
                }
            }
            self.set(settled);
        }
    }

    async fn reconnect(&self) -> bool {
        if let Err(e) = self.transport.disconnect(&self.addr).await {
            tracing::debug!("Disconnect from {} failed: {}", self.addr.peer_id(), e);
        }
        match self.transport.connect(&self.addr, None).await {
            Ok(()) => {
                tracing::info!("Reconnected to {}", self.addr);
                true
            }
            Err(e) => {
                tracing::warn!("Reconnect to {} failed: {}", self.addr, e);
                false
            }
        }
    }
}
