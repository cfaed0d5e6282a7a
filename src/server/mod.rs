//! Client attachment
//!
//! Clients that want to use the node can arrive at any time, including while
//! the node is still starting. They are queued in a bounded channel and
//! attached to the request-serving surface by `serve_clients`.

mod status;

pub use status::{NodeStatus, PeerStatus, StatusServer};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Client queue closed")]
    Closed,

    #[error("Client queue full")]
    Full,

    #[error("Failed to attach client: {0}")]
    Attach(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sending side, handed to whatever accepts client connections
pub struct ClientAcceptor<C> {
    tx: mpsc::Sender<C>,
}

impl<C> Clone for ClientAcceptor<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C: Send> ClientAcceptor<C> {
    /// Queue a client, waiting for room
    pub async fn accept(&self, client: C) -> Result<(), ServerError> {
        self.tx.send(client).await.map_err(|_| ServerError::Closed)
    }

    /// Queue a client without waiting
    pub fn try_accept(&self, client: C) -> Result<(), ServerError> {
        self.tx.try_send(client).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServerError::Full,
            mpsc::error::TrySendError::Closed(_) => ServerError::Closed,
        })
    }
}

/// Receiving side, consumed by `serve_clients`
pub struct ClientQueue<C> {
    rx: mpsc::Receiver<C>,
}

/// Bounded client queue
pub fn client_channel<C>(capacity: usize) -> (ClientAcceptor<C>, ClientQueue<C>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ClientAcceptor { tx }, ClientQueue { rx })
}

/// Surface that serves requests from attached clients
#[async_trait]
pub trait RequestServer<C>: Send + Sync {
    async fn attach(&self, client: C) -> Result<(), ServerError>;
}

/// Attach queued clients until shutdown.
///
/// On shutdown the queue is closed, so further `accept` calls fail with
/// `Closed`, and clients already queued are still attached before
/// returning. Returns the number of clients attached.
pub async fn serve_clients<C, S>(
    mut queue: ClientQueue<C>,
    server: Arc<S>,
    mut shutdown: broadcast::Receiver<()>,
) -> usize
where
    C: Send + 'static,
    S: RequestServer<C> + ?Sized,
{
    let mut attached = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            client = queue.rx.recv() => match client {
                Some(client) => attached += attach(server.as_ref(), client).await,
                None => return attached,
            },
        }
    }

    queue.rx.close();
    while let Some(client) = queue.rx.recv().await {
        attached += attach(server.as_ref(), client).await;
    }

    tracing::debug!("Client queue drained, {} clients attached", attached);
    attached
}

async fn attach<C, S>(server: &S, client: C) -> usize
where
    S: RequestServer<C> + ?Sized,
{
    match server.attach(client).await {
        Ok(()) => 1,
        Err(e) => {
            tracing::warn!("Failed to attach client: {}", e);
            0
        }
    }
}
