//! Protocol message envelope and payload types
//!
//! The envelope carries a type tag, a millisecond timestamp, the payload as
//! raw JSON, and an optional hex HMAC. The payload stays in its raw form so
//! that HMAC verification operates on exactly the bytes the sender signed.

use std::collections::HashMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use syncdev_index::FileInfo;

use crate::errors::{ProtoError, Result};

/// Protocol version announced in `Hello`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum file data carried by a single `FileChunk`, before base64 encoding.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// The kind of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Hello,
    PairingRequest,
    PairingResponse,
    SyncRequest,
    SyncResponse,
    IndexExchange,
    FileRequest,
    FileResponse,
    FileChunk,
    FileComplete,
    DeleteFile,
    DeleteAck,
    Ping,
    Pong,
    Error,
    FolderPairSync,
}

impl MessageType {
    /// Wire tag for this message kind, as it appears in the `type` field and
    /// in the HMAC input.
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::PairingRequest => "pairing_request",
            MessageType::PairingResponse => "pairing_response",
            MessageType::SyncRequest => "sync_request",
            MessageType::SyncResponse => "sync_response",
            MessageType::IndexExchange => "index_exchange",
            MessageType::FileRequest => "file_request",
            MessageType::FileResponse => "file_response",
            MessageType::FileChunk => "file_chunk",
            MessageType::FileComplete => "file_complete",
            MessageType::DeleteFile => "delete_file",
            MessageType::DeleteAck => "delete_ack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::FolderPairSync => "folder_pair_sync",
        }
    }

    /// Message kinds that are legal on a connection without an armed secret.
    pub fn allowed_unpaired(self) -> bool {
        matches!(
            self,
            MessageType::Hello
                | MessageType::PairingRequest
                | MessageType::PairingResponse
                | MessageType::Ping
                | MessageType::Pong
                | MessageType::Error
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// The envelope for every protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hmac: String,
}

impl Message {
    /// Create a message carrying the given payload.
    pub fn new<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            msg_type,
            timestamp: Utc::now().timestamp_millis(),
            payload: Some(raw),
            hmac: String::new(),
        })
    }

    /// Create a message with no payload (`Ping`, `Pong`).
    pub fn without_payload(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            timestamp: Utc::now().timestamp_millis(),
            payload: None,
            hmac: String::new(),
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.payload {
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
            None => Err(ProtoError::MissingPayload(self.msg_type.wire_name())),
        }
    }

    /// The raw payload bytes as sent on the wire (empty if absent).
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload
            .as_deref()
            .map(|raw| raw.get().as_bytes())
            .unwrap_or(b"")
    }

    /// Encode the message as one newline-terminated JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Decode a single frame. The trailing newline is optional.
    pub fn decode(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }
}

/// Sent when establishing a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub device_id: String,
    pub device_name: String,
    pub version: String,
}

/// Sent to initiate pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub device_id: String,
    pub device_name: String,
    pub code: String,
}

/// The response to a pairing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shared_secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests a sync for a folder pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub folder_pair_id: String,
    pub local_path: String,
    pub remote_path: String,
}

/// Acknowledges a sync request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub folder_pair_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Carries the file index for one side of a folder pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexExchange {
    pub folder_pair_id: String,
    pub index: HashMap<String, FileInfo>,
}

/// Requests a file from the remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub folder_pair_id: String,
    pub file_path: String,
    pub offset: u64,
}

/// Metadata about a requested file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub folder_pair_id: String,
    pub file_path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One chunk of file data. `data` is base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub folder_pair_id: String,
    pub file_path: String,
    pub offset: u64,
    pub data: String,
    pub is_last: bool,
}

/// Signals that a file transfer finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileComplete {
    pub folder_pair_id: String,
    pub file_path: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests deletion of a file. `DeleteAck` echoes the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFile {
    pub folder_pair_id: String,
    pub file_path: String,
}

/// Error information surfaced to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Shares a folder pair configuration with the peer. Paths are from the
/// sender's point of view; the recipient mirrors them swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPairSync {
    pub folder_pair_id: String,
    pub local_path: String,
    pub remote_path: String,
    /// `"add"` or `"remove"`.
    pub action: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_single_line() {
        let msg = Message::new(
            MessageType::SyncRequest,
            &SyncRequest {
                folder_pair_id: "pair-1".to_string(),
                local_path: "/tmp/a".to_string(),
                remote_path: "/tmp/b".to_string(),
            },
        )
        .unwrap();

        let frame = msg.encode().unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        // No embedded newlines before the terminator
        assert!(!frame[..frame.len() - 1].contains(&b'\n'));
    }

    #[test]
    fn test_roundtrip_preserves_payload() {
        let msg = Message::new(
            MessageType::FileChunk,
            &FileChunk {
                folder_pair_id: "pair-1".to_string(),
                file_path: "docs/notes.md".to_string(),
                offset: 1024,
                data: "aGVsbG8=".to_string(),
                is_last: true,
            },
        )
        .unwrap();

        let frame = msg.encode().unwrap();
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.msg_type, MessageType::FileChunk);
        assert_eq!(decoded.timestamp, msg.timestamp);

        let chunk: FileChunk = decoded.parse_payload().unwrap();
        assert_eq!(chunk.file_path, "docs/notes.md");
        assert_eq!(chunk.offset, 1024);
        assert!(chunk.is_last);
    }

    #[test]
    fn test_payload_field_names_are_camel_case() {
        let msg = Message::new(
            MessageType::Hello,
            &Hello {
                device_id: "dev-1".to_string(),
                device_name: "laptop".to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
        )
        .unwrap();

        let raw = std::str::from_utf8(msg.payload_bytes()).unwrap();
        assert!(raw.contains("\"deviceId\""));
        assert!(raw.contains("\"deviceName\""));
    }

    #[test]
    fn test_missing_payload_is_an_error() {
        let msg = Message::without_payload(MessageType::Ping);
        assert!(msg.payload.is_none());
        assert!(msg.parse_payload::<Hello>().is_err());
    }

    #[test]
    fn test_unpaired_whitelist() {
        assert!(MessageType::Hello.allowed_unpaired());
        assert!(MessageType::PairingRequest.allowed_unpaired());
        assert!(MessageType::PairingResponse.allowed_unpaired());
        assert!(MessageType::Ping.allowed_unpaired());
        assert!(MessageType::Pong.allowed_unpaired());
        assert!(MessageType::Error.allowed_unpaired());

        assert!(!MessageType::SyncRequest.allowed_unpaired());
        assert!(!MessageType::IndexExchange.allowed_unpaired());
        assert!(!MessageType::FileChunk.allowed_unpaired());
        assert!(!MessageType::FolderPairSync.allowed_unpaired());
    }

    #[test]
    fn test_wire_tags() {
        let msg = Message::without_payload(MessageType::FolderPairSync);
        let frame = msg.encode().unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.contains("\"type\":\"folder_pair_sync\""));
    }
}
