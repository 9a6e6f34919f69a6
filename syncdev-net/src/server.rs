//! TCP server for inbound peer connections
//!
//! Accepts connections on the configured port. An inbound connection must
//! deliver a `Hello` within ten seconds or it is dropped. Identified
//! connections are installed in the registry (last Hello wins) and handed a
//! read loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use syncdev_proto::{Hello, MessageType};

use crate::connection::PeerConnection;
use crate::errors::Result;
use crate::handler::ConnectionHandler;
use crate::registry::{run_read_loop, ConnectionRegistry};

pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    port: u16,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(
        port: u16,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn ConnectionHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            port,
            registry,
            handler,
            shutdown,
        }
    }

    /// Bind the listen port and spawn the accept loop. Returns the bound
    /// address (useful when the configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening for peer connections");

        let registry = self.registry.clone();
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(accept_loop(listener, registry, handler, shutdown));
        Ok(local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_inbound(
                        stream,
                        addr,
                        registry.clone(),
                        handler.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(%err, "failed to accept connection"),
            }
        }
    }
}

async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: CancellationToken,
) {
    let conn = Arc::new(PeerConnection::new(stream, addr));

    let hello = match timeout(HELLO_TIMEOUT, conn.read_message()).await {
        Ok(Ok(msg)) if msg.msg_type == MessageType::Hello => {
            match msg.parse_payload::<Hello>() {
                Ok(hello) => hello,
                Err(err) => {
                    warn!(%addr, %err, "malformed hello");
                    conn.close().await;
                    return;
                }
            }
        }
        Ok(Ok(msg)) => {
            warn!(%addr, got = %msg.msg_type, "expected hello");
            conn.close().await;
            return;
        }
        Ok(Err(err)) => {
            debug!(%addr, %err, "connection failed before hello");
            conn.close().await;
            return;
        }
        Err(_) => {
            warn!(%addr, "no hello within {:?}", HELLO_TIMEOUT);
            conn.close().await;
            return;
        }
    };

    conn.set_identity(&hello.device_id, &hello.device_name);
    info!(peer = %hello.device_name, id = %hello.device_id, %addr, "peer connected");

    install_connection(&registry, conn.clone()).await;
    handler.on_connect(conn.clone()).await;
    run_read_loop(registry, conn, handler, shutdown).await;
}

/// Install a connection, closing any older one for the same peer id.
pub async fn install_connection(registry: &Arc<ConnectionRegistry>, conn: Arc<PeerConnection>) {
    if let Some(displaced) = registry.insert(conn.clone()).await {
        debug!(peer = %conn.peer_id(), "replacing existing connection");
        displaced.close().await;
    }
}
