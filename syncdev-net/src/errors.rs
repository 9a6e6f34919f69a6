//! Error types for the peer transport

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] syncdev_proto::ProtoError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("HMAC verification failed")]
    HmacVerification,

    #[error("message type {0} is not allowed before pairing")]
    UnpairedMessage(&'static str),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("expected hello, got {0}")]
    ExpectedHello(&'static str),
}

pub type Result<T> = std::result::Result<T, NetError>;
