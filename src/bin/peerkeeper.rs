//! PeerKeeper daemon entry point

use peerkeeper_core::directory::{BootstrapDirectory, HttpPeerSource, PeerCache};
use peerkeeper_core::p2p::{load_or_generate_keypair, Libp2pTransport};
use peerkeeper_core::server::{client_channel, serve_clients, ClientAcceptor, StatusServer};
use peerkeeper_core::{PeerKeeperConfig, PeerKeeperNode};

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("PeerKeeper daemon starting...");

    let config_path = PeerKeeperConfig::default_path();
    let config = PeerKeeperConfig::load_from(&config_path)?;

    // Clients connecting during startup wait in the queue
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (acceptor, queue) = client_channel::<TcpStream>(config.client_queue_capacity);
    let listener = TcpListener::bind(&config.ipc_address)
        .await
        .with_context(|| format!("Failed to bind status socket {}", config.ipc_address))?;
    info!("Status socket listening on {}", config.ipc_address);
    let listening = tokio::spawn(accept_loop(listener, acceptor, shutdown_tx.subscribe()));

    let cache = PeerCache::open(Path::new(&config.data_path).join("cache"))?;
    let remote = HttpPeerSource::new(config.peers_url(), &config.transport_marker, config.fetch_timeout())?;
    let source = Arc::new(BootstrapDirectory::new(cache.clone(), remote));

    let keypair = load_or_generate_keypair(&cache)?;
    let transport = Arc::new(Libp2pTransport::spawn(keypair, config.node_config()?).await?);
    let peer_id = transport.local_peer_id().to_string();
    info!("Local peer ID: {}", peer_id);

    let mut node = PeerKeeperNode::bootstrap(config, source, transport.clone()).await?;

    let status = Arc::new(StatusServer::new(peer_id, node.connections().states()));
    let serving = tokio::spawn(serve_clients(queue, status, shutdown_tx.subscribe()));

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(());
    node.shutdown();
    transport.shutdown();

    let _ = listening.await;
    let attached = serving.await.unwrap_or(0);
    info!("PeerKeeper daemon stopped ({} status clients served)", attached);
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: ClientAcceptor<TcpStream>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = acceptor.try_accept(stream) {
                        warn!("Dropping status client {}: {}", addr, e);
                    }
                }
                Err(e) => warn!("Status socket accept failed: {}", e),
            },
        }
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
