//! Engine status, activity events, and the UI capability
//!
//! The embedding shell supplies an [`EngineEvents`] implementation at engine
//! construction. All methods default to no-ops so a consumer only overrides
//! the channels it renders.

use chrono::{DateTime, Utc};
use serde::Serialize;

use syncdev_sync::{AggregateProgress, TransferProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Scanning,
    Syncing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncEventKind {
    Push,
    Pull,
    Delete,
    Error,
}

/// One entry in the engine's activity log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    pub folder_pair: String,
    pub file_path: String,
    pub peer_name: String,
    pub description: String,
}

impl SyncEvent {
    pub fn new(kind: SyncEventKind, description: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            kind,
            folder_pair: String::new(),
            file_path: String::new(),
            peer_name: String::new(),
            description: description.into(),
        }
    }

    pub fn folder_pair(mut self, id: impl Into<String>) -> Self {
        self.folder_pair = id.into();
        self
    }

    pub fn file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = name.into();
        self
    }
}

/// Typed callbacks the engine raises toward its embedding UI.
pub trait EngineEvents: Send + Sync {
    fn status_changed(&self, _status: SyncStatus, _action: &str) {}
    fn transfer_progress(&self, _progress: &TransferProgress) {}
    fn aggregate_progress(&self, _progress: &AggregateProgress) {}
    fn sync_started(&self) {}
    fn sync_ended(&self) {}
    fn event_logged(&self, _event: &SyncEvent) {}
    fn peers_changed(&self) {}
}

/// Headless operation: every callback is a no-op.
impl EngineEvents for () {}
