//! libp2p node driving the bootstrap connections
//!
//! The swarm lives in its own task and is driven through a command channel;
//! `Libp2pTransport` is the cloneable-by-Arc handle the rest of the crate
//! talks to.

use super::{ContentId, NodeTransport, NodeValue, TransportError};
use crate::directory::{PeerAddress, PeerCache};

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identify,
    identity::Keypair,
    multiaddr::Protocol,
    noise, ping,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const PROTOCOL_VERSION: &str = "/peerkeeper/1.0.0";

/// Commands buffered between callers and the swarm task
const COMMAND_BUFFER: usize = 64;

/// Configuration for P2P node
#[derive(Debug, Clone)]
pub struct P2PNodeConfig {
    /// Listen addresses (none: dial-only node)
    pub listen_addresses: Vec<Multiaddr>,

    /// How often established connections are pinged
    pub ping_interval: Duration,

    /// Failure threshold for a single ping
    pub ping_timeout: Duration,

    /// Idle connections are closed after this long
    pub idle_connection_timeout: Duration,
}

impl Default for P2PNodeConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![],
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(20),
            idle_connection_timeout: Duration::from_secs(300),
        }
    }
}

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct KeeperBehaviour {
    /// Liveness pings on every connection
    pub ping: ping::Behaviour,

    /// Identify protocol for peer information
    pub identify: identify::Behaviour,
}

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

enum Command {
    Dial {
        addr: Multiaddr,
        peer: PeerId,
        reply: Reply<()>,
    },
    Ping {
        addr: Multiaddr,
        peer: PeerId,
        reply: Reply<Duration>,
    },
    Disconnect {
        peer: PeerId,
        reply: Reply<()>,
    },
    ListPeers {
        reply: oneshot::Sender<Vec<PeerAddress>>,
    },
}

/// Handle to the running libp2p node
pub struct Libp2pTransport {
    /// Local peer ID
    local_peer_id: PeerId,

    commands: mpsc::Sender<Command>,

    driver: JoinHandle<()>,
}

impl Libp2pTransport {
    /// Build the swarm, start listening and spawn the event loop
    pub async fn spawn(keypair: Keypair, config: P2PNodeConfig) -> Result<Self, TransportError> {
        let local_peer_id = PeerId::from(keypair.public());
        tracing::info!("Creating P2P node with PeerId: {}", local_peer_id);

        let mut swarm = build_swarm(keypair, &config).await?;
        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| TransportError::InitializationFailed(e.to_string()))?;
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let driver = SwarmDriver {
            swarm,
            commands: command_rx,
            book: PeerBook::default(),
        };

        Ok(Self {
            local_peer_id,
            commands,
            driver: tokio::spawn(driver.run()),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Stop the swarm task. Pending and later calls fail with `Stopped`.
    pub fn shutdown(&self) {
        self.driver.abort();
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, TransportError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| TransportError::Stopped)?;
        response.await.map_err(|_| TransportError::Stopped)?
    }
}

impl Drop for Libp2pTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl NodeTransport for Libp2pTransport {
    async fn probe(&self, addr: &PeerAddress) -> Result<Duration, TransportError> {
        let (addr, peer) = parse_address(addr)?;
        self.request(|reply| Command::Ping { addr, peer, reply }).await
    }

    async fn connect(
        &self,
        addr: &PeerAddress,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let (addr, peer) = parse_address(addr)?;
        let dial = self.request(|reply| Command::Dial { addr, peer, reply });

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, dial)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => dial.await,
        }
    }

    async fn disconnect(&self, addr: &PeerAddress) -> Result<(), TransportError> {
        let (_, peer) = parse_address(addr)?;
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    async fn list_peers(&self) -> Result<Vec<PeerAddress>, TransportError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::ListPeers { reply })
            .await
            .map_err(|_| TransportError::Stopped)?;
        response.await.map_err(|_| TransportError::Stopped)
    }

    async fn want_list(
        &self,
        _peer_id: &str,
        _timeout: Duration,
    ) -> Result<Vec<ContentId>, TransportError> {
        Err(TransportError::Unsupported("block exchange want-lists"))
    }

    async fn fetch_node(&self, _cid: &ContentId) -> Result<NodeValue, TransportError> {
        Err(TransportError::Unsupported("block retrieval"))
    }
}

/// Reuse the node key stored in the cache, or create and store a new one
pub fn load_or_generate_keypair(cache: &PeerCache) -> Result<Keypair, TransportError> {
    let stored = cache
        .load_node_key()
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?;

    if let Some(bytes) = stored {
        match Keypair::from_protobuf_encoding(&bytes) {
            Ok(keypair) => return Ok(keypair),
            Err(e) => tracing::warn!("Stored node key unreadable, generating a new one: {}", e),
        }
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?;
    cache
        .save_node_key(&encoded)
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?;

    Ok(keypair)
}

/// Build the libp2p swarm with all protocols
async fn build_swarm(
    keypair: Keypair,
    config: &P2PNodeConfig,
) -> Result<Swarm<KeeperBehaviour>, TransportError> {
    let ping_config = ping::Config::new()
        .with_interval(config.ping_interval)
        .with_timeout(config.ping_timeout);
    let idle_timeout = config.idle_connection_timeout;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?
        .with_dns()
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?
        .with_behaviour(|keypair| KeeperBehaviour {
            ping: ping::Behaviour::new(ping_config),
            identify: identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), keypair.public())
                    .with_agent_version(format!("peerkeeper/{}", env!("CARGO_PKG_VERSION"))),
            ),
        })
        .map_err(|e| TransportError::InitializationFailed(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

/// Parse a directory entry into a multiaddr and the peer it names
fn parse_address(addr: &PeerAddress) -> Result<(Multiaddr, PeerId), TransportError> {
    let multiaddr: Multiaddr = addr
        .as_str()
        .parse()
        .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", addr, e)))?;

    let peer = extract_peer_id(&multiaddr)
        .ok_or_else(|| TransportError::InvalidAddress(format!("{} has no /p2p/ component", addr)))?;

    Ok((multiaddr, peer))
}

/// Extract peer ID from multiaddr
fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}

fn with_peer_id(addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    if extract_peer_id(addr).is_some() {
        addr.clone()
    } else {
        addr.clone().with(Protocol::P2p(peer))
    }
}

/// Connection bookkeeping of the swarm task
#[derive(Default)]
struct PeerBook {
    /// Peers with an outgoing dial in flight
    dialing: HashSet<PeerId>,

    /// Connect calls waiting for the connection to come up
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,

    /// Probe calls waiting for the next ping result
    pending_pings: HashMap<PeerId, Vec<Reply<Duration>>>,

    /// Connected peers and the address they were reached on
    connected: HashMap<PeerId, Multiaddr>,
}

impl PeerBook {
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains_key(peer)
    }

    /// Mark a dial as started. False if one is already in flight.
    fn begin_dial(&mut self, peer: PeerId) -> bool {
        self.dialing.insert(peer)
    }

    fn wait_for_dial(&mut self, peer: PeerId, reply: Reply<()>) {
        self.pending_dials.entry(peer).or_default().push(reply);
    }

    fn wait_for_ping(&mut self, peer: PeerId, reply: Reply<Duration>) {
        self.pending_pings.entry(peer).or_default().push(reply);
    }

    fn established(&mut self, peer: PeerId, addr: Multiaddr) {
        self.dialing.remove(&peer);
        self.connected.insert(peer, addr);
        for reply in self.pending_dials.remove(&peer).unwrap_or_default() {
            let _ = reply.send(Ok(()));
        }
    }

    fn dial_failed(&mut self, peer: PeerId, error: TransportError) {
        self.dialing.remove(&peer);
        if self.is_connected(&peer) {
            return;
        }
        for reply in self.pending_dials.remove(&peer).unwrap_or_default() {
            let _ = reply.send(Err(error.clone()));
        }
        for reply in self.pending_pings.remove(&peer).unwrap_or_default() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn ping_result(&mut self, peer: PeerId, outcome: Result<Duration, TransportError>) {
        for reply in self.pending_pings.remove(&peer).unwrap_or_default() {
            let _ = reply.send(outcome.clone());
        }
    }

    /// Drop a peer that was disconnected, so the next dial is not skipped
    fn forget(&mut self, peer: &PeerId) {
        self.connected.remove(peer);
    }

    fn peers(&self) -> Vec<PeerAddress> {
        self.connected
            .iter()
            .map(|(peer, addr)| PeerAddress::new(with_peer_id(addr, *peer).to_string()))
            .collect()
    }
}

/// Owns the swarm and answers commands from `Libp2pTransport`
struct SwarmDriver {
    swarm: Swarm<KeeperBehaviour>,
    commands: mpsc::Receiver<Command>,
    book: PeerBook,
}

impl SwarmDriver {
    /// Run the event loop until every handle is dropped
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("P2P node handles dropped, stopping swarm");
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { addr, peer, reply } => {
                if self.book.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                match self.dial(peer, addr) {
                    Ok(()) => self.book.wait_for_dial(peer, reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            Command::Ping { addr, peer, reply } => {
                if !self.book.is_connected(&peer) {
                    if let Err(e) = self.dial(peer, addr) {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
                self.book.wait_for_ping(peer, reply);
            }

            Command::Disconnect { peer, reply } => {
                self.book.forget(&peer);
                let result = self
                    .swarm
                    .disconnect_peer_id(peer)
                    .map_err(|_| TransportError::NotConnected(peer.to_string()));
                let _ = reply.send(result);
            }

            Command::ListPeers { reply } => {
                let _ = reply.send(self.book.peers());
            }
        }
    }

    fn dial(&mut self, peer: PeerId, addr: Multiaddr) -> Result<(), TransportError> {
        if !self.book.begin_dial(peer) {
            return Ok(());
        }

        let opts = DialOpts::peer_id(peer).addresses(vec![addr]).build();
        self.swarm.dial(opts).map_err(|e| {
            self.book.dialing.remove(&peer);
            TransportError::ConnectionFailed(e.to_string())
        })
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<KeeperBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {}", address);
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                tracing::debug!("Connection established with {}", peer_id);
                self.book
                    .established(peer_id, endpoint.get_remote_address().clone());
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                tracing::debug!("Dial to {} failed: {}", peer_id, error);
                self.book
                    .dial_failed(peer_id, TransportError::ConnectionFailed(error.to_string()));
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => {
                tracing::debug!("Disconnected from {}", peer_id);
                self.book.forget(&peer_id);
            }

            SwarmEvent::Behaviour(KeeperBehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
                let outcome = result.map_err(|e| TransportError::PingFailed(e.to_string()));
                self.book.ping_result(peer, outcome);
            }

            SwarmEvent::Behaviour(KeeperBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                tracing::debug!(
                    "Identified peer {}: {} ({})",
                    peer_id,
                    info.agent_version,
                    info.protocol_version
                );
            }

            _ => {}
        }
    }
}
