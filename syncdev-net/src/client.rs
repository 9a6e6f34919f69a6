//! TCP client for outbound peer connections
//!
//! Dials a peer with a ten-second timeout and sends our `Hello` immediately,
//! then exposes typed helpers for every message kind the engine sends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use syncdev_index::FileInfo;
use syncdev_proto::{
    DeleteFile, ErrorPayload, FileChunk, FileComplete, FileRequest, FolderPairSync, Hello,
    IndexExchange, Message, MessageType, PairingRequest, PairingResponse, SyncRequest,
};

use crate::connection::PeerConnection;
use crate::errors::{NetError, Result};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials peers and sends protocol messages on their connections.
pub struct Client {
    device_id: String,
    device_name: String,
    version: String,
}

impl Client {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            version: version.into(),
        }
    }

    /// Dial `host:port` and send our `Hello`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<PeerConnection>> {
        let addr = format!("{host}:{port}");
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetError::Timeout(format!("dial {addr}")))??;
        let remote_addr = stream.peer_addr()?;

        let conn = Arc::new(PeerConnection::new(stream, remote_addr));
        let hello = Hello {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            version: self.version.clone(),
        };
        conn.send(Message::new(MessageType::Hello, &hello)?).await?;

        debug!(%addr, "connected to peer");
        Ok(conn)
    }

    pub async fn send_pairing_request(&self, conn: &PeerConnection, code: &str) -> Result<()> {
        let payload = PairingRequest {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            code: code.to_string(),
        };
        conn.send(Message::new(MessageType::PairingRequest, &payload)?)
            .await
    }

    pub async fn send_pairing_response(
        &self,
        conn: &PeerConnection,
        accepted: bool,
        shared_secret: &str,
        error: &str,
    ) -> Result<()> {
        let payload = PairingResponse {
            accepted,
            shared_secret: shared_secret.to_string(),
            error: error.to_string(),
        };
        conn.send(Message::new(MessageType::PairingResponse, &payload)?)
            .await
    }

    pub async fn send_sync_request(
        &self,
        conn: &PeerConnection,
        folder_pair_id: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Result<()> {
        let payload = SyncRequest {
            folder_pair_id: folder_pair_id.to_string(),
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
        };
        conn.send(Message::new(MessageType::SyncRequest, &payload)?)
            .await
    }

    pub async fn send_index_exchange(
        &self,
        conn: &PeerConnection,
        folder_pair_id: &str,
        index: HashMap<String, FileInfo>,
    ) -> Result<()> {
        let payload = IndexExchange {
            folder_pair_id: folder_pair_id.to_string(),
            index,
        };
        conn.send(Message::new(MessageType::IndexExchange, &payload)?)
            .await
    }

    pub async fn send_file_request(
        &self,
        conn: &PeerConnection,
        folder_pair_id: &str,
        file_path: &str,
        offset: u64,
    ) -> Result<()> {
        let payload = FileRequest {
            folder_pair_id: folder_pair_id.to_string(),
            file_path: file_path.to_string(),
            offset,
        };
        conn.send(Message::new(MessageType::FileRequest, &payload)?)
            .await
    }

    pub async fn send_file_chunk(&self, conn: &PeerConnection, chunk: &FileChunk) -> Result<()> {
        conn.send(Message::new(MessageType::FileChunk, chunk)?).await
    }

    pub async fn send_file_complete(
        &self,
        conn: &PeerConnection,
        folder_pair_id: &str,
        file_path: &str,
        success: bool,
        error: &str,
    ) -> Result<()> {
        let payload = FileComplete {
            folder_pair_id: folder_pair_id.to_string(),
            file_path: file_path.to_string(),
            success,
            error: error.to_string(),
        };
        conn.send(Message::new(MessageType::FileComplete, &payload)?)
            .await
    }

    pub async fn send_delete_file(
        &self,
        conn: &PeerConnection,
        folder_pair_id: &str,
        file_path: &str,
    ) -> Result<()> {
        let payload = DeleteFile {
            folder_pair_id: folder_pair_id.to_string(),
            file_path: file_path.to_string(),
        };
        conn.send(Message::new(MessageType::DeleteFile, &payload)?)
            .await
    }

    pub async fn send_folder_pair_sync(
        &self,
        conn: &PeerConnection,
        payload: &FolderPairSync,
    ) -> Result<()> {
        conn.send(Message::new(MessageType::FolderPairSync, payload)?)
            .await
    }

    pub async fn send_ping(&self, conn: &PeerConnection) -> Result<()> {
        conn.send(Message::without_payload(MessageType::Ping)).await
    }

    pub async fn send_pong(&self, conn: &PeerConnection) -> Result<()> {
        conn.send(Message::without_payload(MessageType::Pong)).await
    }

    pub async fn send_error(&self, conn: &PeerConnection, code: &str, message: &str) -> Result<()> {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        conn.send(Message::new(MessageType::Error, &payload)?).await
    }
}
