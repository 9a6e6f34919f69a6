//! A single peer connection
//!
//! Wraps a TCP stream split into a buffered reader and a mutex-guarded
//! writer so that a frame and its trailing newline are always written
//! contiguously. Once a shared secret is armed, every outgoing frame is
//! signed and every incoming frame must verify; before that, only the
//! handshake and pairing message kinds are accepted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use syncdev_proto::{auth, Message};

use crate::errors::{NetError, Result};

#[derive(Debug, Clone)]
struct PeerIdentity {
    id: String,
    name: String,
}

/// One live connection to a remote peer.
pub struct PeerConnection {
    identity: OnceLock<PeerIdentity>,
    remote_addr: SocketAddr,
    shared_secret: RwLock<Option<String>>,
    paired: AtomicBool,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl PeerConnection {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            identity: OnceLock::new(),
            remote_addr,
            shared_secret: RwLock::new(None),
            paired: AtomicBool::new(false),
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            closed: CancellationToken::new(),
        }
    }

    /// Record the peer's identity after its `Hello`. Later calls are ignored.
    pub fn set_identity(&self, id: &str, name: &str) {
        let _ = self.identity.set(PeerIdentity {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// The peer's device id (empty until the `Hello` is processed).
    pub fn peer_id(&self) -> String {
        self.identity
            .get()
            .map(|identity| identity.id.clone())
            .unwrap_or_default()
    }

    pub fn peer_name(&self) -> String {
        self.identity
            .get()
            .map(|identity| identity.name.clone())
            .unwrap_or_default()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Install the shared secret and mark the connection paired. Every
    /// frame after this point is signed and verified.
    pub async fn arm_secret(&self, secret: &str) {
        *self.shared_secret.write().await = Some(secret.to_string());
        self.paired.store(true, Ordering::SeqCst);
    }

    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    pub async fn shared_secret(&self) -> Option<String> {
        self.shared_secret.read().await.clone()
    }

    /// Read one frame. Fails when the stream ends, the frame does not
    /// parse, an armed connection receives a bad or missing HMAC, or an
    /// unpaired connection receives a message outside the handshake set.
    pub async fn read_message(&self) -> Result<Message> {
        let mut line = Vec::new();
        {
            let mut reader = self.reader.lock().await;
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
        }

        let msg = Message::decode(&line)?;
        match self.shared_secret().await {
            Some(secret) => {
                if !auth::verify_message(&secret, &msg) {
                    return Err(NetError::HmacVerification);
                }
            }
            None => {
                if !msg.msg_type.allowed_unpaired() {
                    return Err(NetError::UnpairedMessage(msg.msg_type.wire_name()));
                }
            }
        }

        trace!(peer = %self.peer_id(), kind = %msg.msg_type, "received message");
        Ok(msg)
    }

    /// Sign (when armed) and write one frame.
    pub async fn send(&self, mut msg: Message) -> Result<()> {
        if let Some(secret) = self.shared_secret().await {
            msg.hmac = auth::sign_message(&secret, &msg);
        }
        let frame = msg.encode()?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(peer = %self.peer_id(), kind = %msg.msg_type, "sent message");
        Ok(())
    }

    /// Close the connection. The read loop observes the cancellation and
    /// exits; the write half is shut down best-effort.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Resolves when [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id())
            .field("remote_addr", &self.remote_addr)
            .field("paired", &self.is_paired())
            .finish()
    }
}
