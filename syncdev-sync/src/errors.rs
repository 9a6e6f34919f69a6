//! Error types for sync operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] syncdev_proto::ProtoError),

    #[error("network error: {0}")]
    Net(#[from] syncdev_net::NetError),

    #[error("index error: {0}")]
    Index(#[from] syncdev_index::IndexError),

    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
