//! Error types for the engine daemon

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] syncdev_proto::ProtoError),

    #[error("network error: {0}")]
    Net(#[from] syncdev_net::NetError),

    #[error("sync error: {0}")]
    Sync(#[from] syncdev_sync::SyncError),

    #[error("index error: {0}")]
    Index(#[from] syncdev_index::IndexError),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("peer is offline: {0}")]
    PeerOffline(String),

    #[error("folder pair not found: {0}")]
    FolderPairNotFound(String),

    #[error("no connection to peer: {0}")]
    ConnectionNotFound(String),

    #[error("sync already in progress for folder pair: {0}")]
    SyncInProgress(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
