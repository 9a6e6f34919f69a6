//! Error types for protocol encoding and decoding

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message has no payload: {0}")]
    MissingPayload(&'static str),

    #[error("frame is not newline-terminated")]
    UnterminatedFrame,
}

pub type Result<T> = std::result::Result<T, ProtoError>;
