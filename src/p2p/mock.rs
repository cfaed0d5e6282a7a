//! Scriptable in-memory transport for tests

use super::{ContentId, NodeTransport, NodeValue, TransportError};
use crate::directory::PeerAddress;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// How a scripted call resolves
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok,
    Fail,
    Delay(Duration),
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Probe(String),
    Connect(String, Option<Duration>),
    Disconnect(String),
    WantList(String),
    FetchNode(String),
}

pub(crate) struct MockTransport {
    start: Instant,
    probe_replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    connect_replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    peers: Mutex<Vec<PeerAddress>>,
    want_lists: Mutex<HashMap<String, Vec<ContentId>>>,
    nodes: Mutex<HashMap<ContentId, NodeValue>>,
    hanging_nodes: Mutex<HashSet<ContentId>>,
    calls: Mutex<Vec<(Duration, Call)>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            probe_replies: Mutex::new(HashMap::new()),
            connect_replies: Mutex::new(HashMap::new()),
            peers: Mutex::new(vec![]),
            want_lists: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            hanging_nodes: Mutex::new(HashSet::new()),
            calls: Mutex::new(vec![]),
        }
    }

    /// Queue replies for successive probes of `addr`. Unscripted probes succeed.
    pub(crate) fn script_probes(&self, addr: &str, replies: Vec<Reply>) {
        self.probe_replies.lock().insert(addr.to_string(), replies.into());
    }

    pub(crate) fn script_connects(&self, addr: &str, replies: Vec<Reply>) {
        self.connect_replies.lock().insert(addr.to_string(), replies.into());
    }

    pub(crate) fn set_peers(&self, peers: Vec<PeerAddress>) {
        *self.peers.lock() = peers;
    }

    pub(crate) fn set_want_list(&self, peer_id: &str, cids: Vec<ContentId>) {
        self.want_lists.lock().insert(peer_id.to_string(), cids);
    }

    pub(crate) fn set_node(&self, cid: ContentId, value: NodeValue) {
        self.nodes.lock().insert(cid, value);
    }

    /// Fetches of `cid` never complete
    pub(crate) fn hang_node(&self, cid: ContentId) {
        self.hanging_nodes.lock().insert(cid);
    }

    pub(crate) fn calls(&self) -> Vec<(Duration, Call)> {
        self.calls.lock().clone()
    }

    /// Offsets from creation at which matching calls were made
    pub(crate) fn call_times(&self, matches: impl Fn(&Call) -> bool) -> Vec<Duration> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, call)| matches(call))
            .map(|(at, _)| *at)
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push((self.start.elapsed(), call));
    }

    fn next_reply(replies: &Mutex<HashMap<String, VecDeque<Reply>>>, addr: &str) -> Reply {
        replies
            .lock()
            .get_mut(addr)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Reply::Ok)
    }

    async fn play(reply: Reply) -> Result<(), TransportError> {
        match reply {
            Reply::Ok => Ok(()),
            Reply::Fail => Err(TransportError::ConnectionFailed("scripted failure".into())),
            Reply::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    async fn probe(&self, addr: &PeerAddress) -> Result<Duration, TransportError> {
        self.record(Call::Probe(addr.to_string()));
        let reply = Self::next_reply(&self.probe_replies, addr.as_str());
        Self::play(reply).await.map(|_| Duration::from_millis(1))
    }

    async fn connect(
        &self,
        addr: &PeerAddress,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.record(Call::Connect(addr.to_string(), timeout));
        let reply = Self::next_reply(&self.connect_replies, addr.as_str());
        Self::play(reply).await
    }

    async fn disconnect(&self, addr: &PeerAddress) -> Result<(), TransportError> {
        self.record(Call::Disconnect(addr.to_string()));
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerAddress>, TransportError> {
        Ok(self.peers.lock().clone())
    }

    async fn want_list(
        &self,
        peer_id: &str,
        _timeout: Duration,
    ) -> Result<Vec<ContentId>, TransportError> {
        self.record(Call::WantList(peer_id.to_string()));
        self.want_lists
            .lock()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(peer_id.to_string()))
    }

    async fn fetch_node(&self, cid: &ContentId) -> Result<NodeValue, TransportError> {
        self.record(Call::FetchNode(cid.to_string()));
        let hang = self.hanging_nodes.lock().contains(cid);
        if hang {
            std::future::pending::<()>().await;
        }
        self.nodes
            .lock()
            .get(cid)
            .cloned()
            .ok_or(TransportError::Timeout)
    }
}
