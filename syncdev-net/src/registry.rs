//! Connection registry
//!
//! At most one live connection per peer id. A second `Hello` from the same
//! id displaces the first (last writer wins). The lock guards only the map;
//! displaced connections are closed by the caller outside of it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::PeerConnection;
use crate::handler::ConnectionHandler;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection under its peer id, returning any displaced
    /// connection. The caller must close the displaced one.
    pub async fn insert(&self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let peer_id = conn.peer_id();
        let mut connections = self.connections.lock().await;
        connections.insert(peer_id, conn)
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.connections.lock().await.get(peer_id).cloned()
    }

    /// Remove a connection, but only if it is still the registered one.
    /// A connection displaced by a newer `Hello` must not evict its
    /// replacement.
    pub async fn remove(&self, conn: &Arc<PeerConnection>) -> bool {
        let peer_id = conn.peer_id();
        let mut connections = self.connections.lock().await;
        match connections.get(&peer_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(&peer_id);
                true
            }
            _ => false,
        }
    }

    /// Take every registered connection, leaving the registry empty. Used
    /// at shutdown so the connections can be closed outside the lock.
    pub async fn drain(&self) -> Vec<Arc<PeerConnection>> {
        let mut connections = self.connections.lock().await;
        connections.drain().map(|(_, conn)| conn).collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

/// Drive a connection's read loop until the connection fails, is closed, or
/// the engine shuts down. Cleans up the registry entry and notifies the
/// handler on exit.
pub async fn run_read_loop(
    registry: Arc<ConnectionRegistry>,
    conn: Arc<PeerConnection>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = conn.closed() => break,
            result = conn.read_message() => match result {
                Ok(msg) => handler.handle_message(conn.clone(), msg).await,
                Err(err) => {
                    debug!(peer = %conn.peer_id(), %err, "read loop ending");
                    break;
                }
            }
        }
    }

    registry.remove(&conn).await;
    conn.close().await;
    handler.on_disconnect(conn).await;
}
