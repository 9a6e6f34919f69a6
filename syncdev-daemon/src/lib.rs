//! The syncdev engine daemon
//!
//! Wires the sync engine together: configuration and secret stores, mDNS
//! discovery, the pairing controller, and the [`Engine`] facade that drives
//! scanning, index exchange, and transfers against paired peers.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod events;
pub mod pairing;
pub mod secrets;
pub mod store;

pub use config::{Config, FolderPair, Peer, PeerStatus, APP_VERSION, DEFAULT_PORT, SERVICE_TYPE};
pub use discovery::{Discovery, DiscoveryEvent};
pub use engine::{Engine, SyncPreview};
pub use errors::{EngineError, Result};
pub use events::{EngineEvents, SyncEvent, SyncEventKind, SyncStatus};
pub use pairing::{PairingController, PairingValidation};
pub use secrets::{FileSecretStore, SecretStore};
pub use store::ConfigStore;
