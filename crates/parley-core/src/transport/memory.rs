//! In-process transport
//!
//! Every successful [`MemoryConnector::connect`] produces a [`MemoryPeer`]
//! playing the server side of that connection. Used by the test suites and
//! by embedders that bridge the channel onto another event loop.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{Connector, Transport};
use crate::envelope::{self, Envelope};
use crate::error::{ChatError, Result};
use crate::session::Identity;

struct Shared {
    live: AtomicUsize,
    total: AtomicUsize,
    fail_next: AtomicU32,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

/// Decrements the live count once both client halves are gone
struct LiveGuard(Arc<Shared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector backed by in-memory queues
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                live: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                fail_next: AtomicU32::new(0),
                peers_tx,
                peers_rx: Mutex::new(peers_rx),
            }),
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next(&self, count: u32) {
        self.shared.fail_next.store(count, Ordering::SeqCst);
    }

    /// Connections whose client side has not been dropped yet
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Connections established so far
    pub fn total_connections(&self) -> usize {
        self.shared.total.load(Ordering::SeqCst)
    }

    /// Wait for the next established connection
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.shared.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str, identity: &Identity) -> Result<Transport> {
        let refused = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!("Memory transport refusing connection to {}", endpoint);
            return Err(ChatError::Connect(format!("connection refused: {endpoint}")));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<Result<Vec<u8>>>();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.shared.total.fetch_add(1, Ordering::SeqCst);
        let guard = Arc::new(LiveGuard(self.shared.clone()));

        let sink = futures_util::sink::unfold(
            (from_client_tx, guard.clone()),
            |(tx, guard), frame: Vec<u8>| async move {
                tx.send(frame)
                    .map_err(|_| ChatError::Transport("peer hung up".to_string()))?;
                Ok::<_, ChatError>((tx, guard))
            },
        );

        let stream = futures_util::stream::unfold((to_client_rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|frame| (frame, (rx, guard)))
        });

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            identity: identity.clone(),
            to_client: to_client_tx,
            from_client: from_client_rx,
        };
        self.shared
            .peers_tx
            .send(peer)
            .map_err(|_| ChatError::Connect("memory transport closed".to_string()))?;

        Ok(Transport::new(sink, stream))
    }
}

/// Server side of one in-memory connection. Dropping it hangs up.
pub struct MemoryPeer {
    pub endpoint: String,
    pub identity: Identity,
    to_client: mpsc::UnboundedSender<Result<Vec<u8>>>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryPeer {
    /// Deliver a raw frame to the client. False once the client is gone.
    pub fn push(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.to_client.send(Ok(frame.into())).is_ok()
    }

    /// Deliver an encoded envelope to the client
    pub fn push_envelope(&self, envelope: &Envelope) -> Result<bool> {
        Ok(self.push(envelope::encode(envelope)?))
    }

    /// Surface a transport error on the client's stream
    pub fn fail(&self, error: ChatError) -> bool {
        self.to_client.send(Err(error)).is_ok()
    }

    /// Next frame written by the client; `None` once its sink is dropped
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.recv().await
    }

    /// Next frame written by the client, decoded
    pub async fn recv_envelope(&mut self) -> Option<Result<Envelope>> {
        self.recv().await.map(|frame| envelope::decode(&frame))
    }

    /// Whether the client has dropped its end of the connection
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }

    /// Close the connection from the server side
    pub fn hang_up(self) {
        drop(self);
    }
}
