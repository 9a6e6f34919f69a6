//! Wire protocol for the syncdev peer channel
//!
//! Every frame on a peer connection is a single JSON-encoded [`Message`]
//! followed by a newline. Paired connections authenticate each frame with an
//! HMAC-SHA256 tag computed over the message type, timestamp, and raw
//! payload bytes.

pub mod auth;
pub mod errors;
pub mod messages;

pub use auth::{generate_pairing_code, generate_shared_secret, sign_message, verify_message};
pub use errors::{ProtoError, Result};
pub use messages::{
    DeleteFile, ErrorPayload, FileChunk, FileComplete, FileRequest, FileResponse, FolderPairSync,
    Hello, IndexExchange, Message, MessageType, PairingRequest, PairingResponse, SyncRequest,
    SyncResponse, CHUNK_SIZE, PROTOCOL_VERSION,
};
