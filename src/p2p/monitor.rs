//! Block request monitor
//!
//! Debug aid that polls the want-lists of connected peers and logs every
//! content id the first time it is requested, along with what that block
//! contains locally. Only switched on for development hosts.

use super::{ContentId, NodeTransport, NodeValue};
use crate::directory::PeerAddress;

use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Number of bytes shown when logging opaque block data
const DATA_PREVIEW_BYTES: usize = 32;

/// Lower bound of the poll interval; a zero period is not a valid tick
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between polls
    pub poll_interval: Duration,

    /// Per-peer want-list query timeout
    pub want_list_timeout: Duration,

    /// Bound on loading a requested block for description
    pub fetch_timeout: Duration,

    /// Also log repeated requests
    pub verbose: bool,

    /// Maximum number of remembered (peer, cid) pairs and cid counters
    pub seen_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            want_list_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(30),
            verbose: false,
            seen_capacity: 10_000,
        }
    }
}

/// Whether the monitor should run on this host
pub fn monitor_enabled_for(host: &str, allowed_hosts: &[String]) -> bool {
    allowed_hosts.iter().any(|allowed| allowed.eq_ignore_ascii_case(host))
}

/// Outcome of recording one want-list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Content id never requested before
    First,

    /// Seen before, from this or another peer
    Repeat { count: u64 },
}

/// Bounded record of which peers asked for which blocks
pub struct RequestLedger {
    seen: LruCache<(String, ContentId), ()>,
    counts: LruCache<ContentId, u64>,
}

impl RequestLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
            counts: LruCache::new(capacity),
        }
    }

    pub fn observe(&mut self, peer_id: &str, cid: &ContentId) -> Sighting {
        let pair_seen = self
            .seen
            .put((peer_id.to_string(), cid.clone()), ())
            .is_some();

        let count = self.counts.get(cid).copied().unwrap_or(0) + 1;
        self.counts.put(cid.clone(), count);

        if count == 1 && !pair_seen {
            Sighting::First
        } else {
            Sighting::Repeat { count }
        }
    }

    /// Times a content id has been observed
    pub fn count(&self, cid: &ContentId) -> u64 {
        self.counts.peek(cid).copied().unwrap_or(0)
    }

    /// Number of distinct (peer, cid) pairs remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Start/stop handle for the polling task. At most one poll loop runs.
pub struct BlockRequestMonitor {
    transport: Arc<dyn NodeTransport>,
    config: MonitorConfig,
    ledger: Arc<Mutex<RequestLedger>>,
    handle: Option<JoinHandle<()>>,
}

impl BlockRequestMonitor {
    pub fn new(transport: Arc<dyn NodeTransport>, config: MonitorConfig) -> Self {
        let ledger = Arc::new(Mutex::new(RequestLedger::new(config.seen_capacity)));
        Self {
            transport,
            config,
            ledger,
            handle: None,
        }
    }

    /// Start polling with a fresh ledger, stopping any previous run
    pub fn start(&mut self) {
        self.stop();
        tracing::info!("Monitoring block requests");

        self.ledger = Arc::new(Mutex::new(RequestLedger::new(self.config.seen_capacity)));
        let inspector = Inspector::new(self.transport.clone(), self.config.clone(), self.ledger.clone());
        self.handle = Some(tokio::spawn(inspector.poll_loop()));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("Stopped block request monitor");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn ledger(&self) -> Arc<Mutex<RequestLedger>> {
        self.ledger.clone()
    }
}

impl Drop for BlockRequestMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Inspector {
    transport: Arc<dyn NodeTransport>,
    config: MonitorConfig,
    ledger: Arc<Mutex<RequestLedger>>,

    /// Peers whose previous inspection has not finished yet
    in_flight: Mutex<HashSet<String>>,
}

impl Inspector {
    fn new(
        transport: Arc<dyn NodeTransport>,
        config: MonitorConfig,
        ledger: Arc<Mutex<RequestLedger>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            ledger,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Poll until aborted. Inspections live in a `JoinSet` owned by this
    /// task, so aborting the loop also cancels them.
    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inspections = JoinSet::new();

        loop {
            ticker.tick().await;
            while let Some(Some(_)) = inspections.join_next().now_or_never() {}
            self.poll_once(&mut inspections).await;
        }
    }

    /// Start an inspection for every listed peer that is not still busy with
    /// the previous one. Never waits on a peer.
    async fn poll_once(self: &Arc<Self>, inspections: &mut JoinSet<()>) {
        let peers = match self.transport.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::debug!("Could not list peers: {}", e);
                return;
            }
        };

        for peer in peers {
            if !self.in_flight.lock().insert(peer.peer_id().to_string()) {
                continue;
            }
            let inspector = self.clone();
            inspections.spawn(async move {
                inspector.inspect_peer(&peer).await;
                inspector.in_flight.lock().remove(peer.peer_id());
            });
        }
    }

    async fn inspect_peer(&self, peer: &PeerAddress) {
        let peer_id = peer.peer_id();
        let wanted = match self
            .transport
            .want_list(peer_id, self.config.want_list_timeout)
            .await
        {
            Ok(wanted) => wanted,
            Err(e) => {
                tracing::debug!("Want-list query for {} failed: {}", peer_id, e);
                return;
            }
        };

        for cid in wanted {
            let sighting = self.ledger.lock().observe(peer_id, &cid);
            match sighting {
                Sighting::First => {
                    tracing::info!("Peer {} requested CID {}", peer_id, cid);
                    self.describe(&cid).await;
                }
                Sighting::Repeat { count } if self.config.verbose => {
                    tracing::info!("Peer {} requested CID {} (#{})", peer_id, cid, count);
                }
                Sighting::Repeat { .. } => {}
            }
        }
    }

    async fn describe(&self, cid: &ContentId) {
        let started = Instant::now();
        let fetch = tokio::time::timeout(self.config.fetch_timeout, self.transport.fetch_node(cid));
        let value = match fetch.await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::debug!("Could not load {}: {}", cid, e);
                return;
            }
            Err(_) => {
                tracing::debug!("Loading {} timed out after {:?}", cid, self.config.fetch_timeout);
                return;
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match value {
            NodeValue::Linked(links) => {
                tracing::info!(
                    "{} is a DAG structure with {} links (loaded locally in {:.2} ms)",
                    cid,
                    links.len(),
                    elapsed_ms
                );
                for link in links {
                    tracing::info!("  {} -> {}", link.name, link.cid);
                }
            }
            NodeValue::Data(bytes) => {
                tracing::info!(
                    "{} is data, {} bytes (loaded locally in {:.2} ms)",
                    cid,
                    bytes.len(),
                    elapsed_ms
                );
                let preview = &bytes[..bytes.len().min(DATA_PREVIEW_BYTES)];
                tracing::debug!("{} starts with {}", cid, hex::encode(preview));
            }
        }
    }
}
