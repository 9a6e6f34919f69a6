//! Configuration model
//!
//! The whole configuration is one JSON document: device identity, listen
//! port, known peers, folder pairs, and global flags. Shared secrets never
//! appear here; they live in the [`SecretStore`](crate::secrets::SecretStore)
//! keyed by peer id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 52525;
pub const DEFAULT_SYNC_INTERVAL_MINS: u32 = 5;

/// mDNS service type advertised and browsed on the local network.
pub const SERVICE_TYPE: &str = "_syncdev._tcp.local.";

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
    Syncing,
    Pairing,
}

impl Default for PeerStatus {
    fn default() -> Self {
        PeerStatus::Offline
    }
}

/// A remote device that can sync with this instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: PeerStatus,
    #[serde(default)]
    pub paired: bool,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: String::new(),
            port: 0,
            version: String::new(),
            status: PeerStatus::Offline,
            paired: false,
            last_seen: Utc::now(),
            last_sync: None,
        }
    }
}

/// A binding of a local directory to a remote directory on one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPair {
    pub id: String,
    pub peer_id: String,
    pub local_path: String,
    pub remote_path: String,
    pub enabled: bool,
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

/// The application configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub device_id: String,
    pub device_name: String,
    pub port: u16,
    pub sync_interval_mins: u32,
    pub global_exclusions: Vec<String>,
    pub peers: Vec<Peer>,
    pub folder_pairs: Vec<FolderPair>,
    pub auto_sync: bool,
    #[serde(default)]
    pub show_notifications: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_name: String::new(),
            port: DEFAULT_PORT,
            sync_interval_mins: DEFAULT_SYNC_INTERVAL_MINS,
            global_exclusions: default_exclusions(),
            peers: Vec::new(),
            folder_pairs: Vec::new(),
            auto_sync: true,
            show_notifications: true,
        }
    }
}

pub fn default_exclusions() -> Vec<String> {
    [
        ".DS_Store",
        ".git",
        ".svn",
        "node_modules",
        "*.tmp",
        "*.swp",
        "*~",
        ".Trash",
        "Thumbs.db",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    pub fn get_peer(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn get_peer_mut(&mut self, id: &str) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    /// Add a peer, replacing any existing record with the same id.
    pub fn add_peer(&mut self, peer: Peer) {
        match self.peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => *existing = peer,
            None => self.peers.push(peer),
        }
    }

    pub fn remove_peer(&mut self, id: &str) {
        self.peers.retain(|p| p.id != id);
    }

    pub fn paired_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.paired)
    }

    pub fn get_folder_pair(&self, id: &str) -> Option<&FolderPair> {
        self.folder_pairs.iter().find(|fp| fp.id == id)
    }

    pub fn get_folder_pair_mut(&mut self, id: &str) -> Option<&mut FolderPair> {
        self.folder_pairs.iter_mut().find(|fp| fp.id == id)
    }

    /// Add a folder pair, replacing any existing record with the same id.
    pub fn add_folder_pair(&mut self, pair: FolderPair) {
        match self.folder_pairs.iter_mut().find(|fp| fp.id == pair.id) {
            Some(existing) => *existing = pair,
            None => self.folder_pairs.push(pair),
        }
    }

    pub fn remove_folder_pair(&mut self, id: &str) {
        self.folder_pairs.retain(|fp| fp.id != id);
    }

    pub fn folder_pairs_for_peer<'a>(&'a self, peer_id: &'a str) -> impl Iterator<Item = &'a FolderPair> + 'a {
        self.folder_pairs.iter().filter(move |fp| fp.peer_id == peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.sync_interval_mins, 5);
        assert!(config.auto_sync);
        assert!(config.global_exclusions.contains(&".DS_Store".to_string()));
    }

    #[test]
    fn test_add_peer_replaces_by_id() {
        let mut config = Config::default();
        config.add_peer(Peer::new("p1", "First"));
        let mut updated = Peer::new("p1", "Renamed");
        updated.paired = true;
        config.add_peer(updated);

        assert_eq!(config.peers.len(), 1);
        let peer = config.get_peer("p1").unwrap();
        assert_eq!(peer.name, "Renamed");
        assert!(peer.paired);
    }

    #[test]
    fn test_folder_pair_lookup() {
        let mut config = Config::default();
        config.add_folder_pair(FolderPair {
            id: "fp1".to_string(),
            peer_id: "p1".to_string(),
            local_path: "/x".to_string(),
            remote_path: "/y".to_string(),
            enabled: true,
            exclusions: vec![],
            last_sync: None,
        });

        assert!(config.get_folder_pair("fp1").is_some());
        assert_eq!(config.folder_pairs_for_peer("p1").count(), 1);
        assert_eq!(config.folder_pairs_for_peer("p2").count(), 0);

        config.remove_folder_pair("fp1");
        assert!(config.get_folder_pair("fp1").is_none());
    }

    #[test]
    fn test_config_json_field_names() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"deviceId\""));
        assert!(json.contains("\"syncIntervalMins\""));
        assert!(json.contains("\"globalExclusions\""));
        assert!(json.contains("\"autoSync\""));
    }
}
