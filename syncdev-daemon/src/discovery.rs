//! mDNS peer discovery
//!
//! Advertises this device as `_syncdev._tcp` with TXT records carrying the
//! device id, name, and version, and browses for other instances. Discovered
//! peers are kept in a map with their freshest address and status; peers
//! unseen for thirty seconds are flagged offline. The engine consumes
//! [`DiscoveryEvent`]s from a broadcast channel.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Peer, PeerStatus, APP_VERSION, SERVICE_TYPE};
use crate::errors::{EngineError, Result};

/// How long a peer may go unseen before it is flagged offline.
const STALE_AFTER: Duration = Duration::from_secs(30);
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Event notifications for peer discovery.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerFound(Peer),
    PeerUpdated(Peer),
    PeerLost(String),
}

/// mDNS advertiser and browser.
pub struct Discovery {
    device_id: String,
    device_name: String,
    port: u16,
    mdns: Mutex<Option<ServiceDaemon>>,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    events: broadcast::Sender<DiscoveryEvent>,
    shutdown: CancellationToken,
}

impl Discovery {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        port: u16,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            port,
            mdns: Mutex::new(None),
            peers: Arc::new(RwLock::new(HashMap::new())),
            events,
            shutdown,
        }
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Start advertising and browsing.
    pub fn start(&self) -> Result<()> {
        let mdns =
            ServiceDaemon::new().map_err(|err| EngineError::Discovery(err.to_string()))?;

        let hostname = format!("{}.local.", gethostname::gethostname().to_string_lossy());
        let mut properties = HashMap::new();
        properties.insert("device_id".to_string(), self.device_id.clone());
        properties.insert("device_name".to_string(), self.device_name.clone());
        properties.insert("version".to_string(), APP_VERSION.to_string());

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.device_id,
            &hostname,
            "",
            self.port,
            properties,
        )
        .map_err(|err| EngineError::Discovery(err.to_string()))?
        .enable_addr_auto();

        mdns.register(service_info)
            .map_err(|err| EngineError::Discovery(err.to_string()))?;

        let receiver = mdns
            .browse(SERVICE_TYPE)
            .map_err(|err| EngineError::Discovery(err.to_string()))?;

        tokio::spawn(handle_service_events(
            receiver,
            self.peers.clone(),
            self.events.clone(),
            self.device_id.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(check_stale_peers(
            self.peers.clone(),
            self.events.clone(),
            self.shutdown.clone(),
        ));

        *self.mdns.lock() = Some(mdns);
        info!(device = %self.device_name, port = self.port, "mDNS discovery started");
        Ok(())
    }

    /// Unregister the advertisement and stop the daemon.
    pub fn stop(&self) {
        if let Some(mdns) = self.mdns.lock().take() {
            let fullname = format!("{}.{}", self.device_id, SERVICE_TYPE);
            let _ = mdns.unregister(&fullname);
            let _ = mdns.shutdown();
            info!("mDNS discovery stopped");
        }
    }

    /// All currently known peers (online and offline).
    pub fn get_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn get_peer(&self, device_id: &str) -> Option<Peer> {
        self.peers.read().get(device_id).cloned()
    }
}

async fn handle_service_events(
    receiver: mdns_sd::Receiver<ServiceEvent>,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    events: broadcast::Sender<DiscoveryEvent>,
    own_device_id: String,
    shutdown: CancellationToken,
) {
    // Maps mDNS instance fullnames back to device ids for removal events
    let mut instances: HashMap<String, String> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receiver.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(peer) = peer_from_service(&info, &own_device_id) else {
                    continue;
                };
                instances.insert(info.get_fullname().to_string(), peer.id.clone());

                let is_new = {
                    let mut peers = peers.write();
                    let is_new = !peers.contains_key(&peer.id);
                    peers.insert(peer.id.clone(), peer.clone());
                    is_new
                };

                if is_new {
                    info!(peer = %peer.name, id = %peer.id, host = %peer.host, "peer discovered");
                    let _ = events.send(DiscoveryEvent::PeerFound(peer));
                } else {
                    let _ = events.send(DiscoveryEvent::PeerUpdated(peer));
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let Some(device_id) = instances.remove(&fullname) else {
                    continue;
                };
                let lost = {
                    let mut peers = peers.write();
                    match peers.get_mut(&device_id) {
                        Some(peer) if peer.status == PeerStatus::Online => {
                            peer.status = PeerStatus::Offline;
                            true
                        }
                        _ => false,
                    }
                };
                if lost {
                    info!(id = %device_id, "peer went offline");
                    let _ = events.send(DiscoveryEvent::PeerLost(device_id));
                }
            }
            other => debug!(?other, "ignoring mDNS event"),
        }
    }
}

/// Build a peer record from a resolved service, skipping our own
/// advertisement and entries without a usable address.
fn peer_from_service(info: &ServiceInfo, own_device_id: &str) -> Option<Peer> {
    let device_id = info.get_property_val_str("device_id")?.to_string();
    if device_id == own_device_id {
        return None;
    }

    let device_name = info
        .get_property_val_str("device_name")
        .map(str::to_string)
        .unwrap_or_else(|| info.get_hostname().to_string());
    let version = info
        .get_property_val_str("version")
        .unwrap_or_default()
        .to_string();

    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    let host = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())?
        .to_string();

    Some(Peer {
        id: device_id,
        name: device_name,
        host,
        port: info.get_port(),
        version,
        status: PeerStatus::Online,
        paired: false,
        last_seen: Utc::now(),
        last_sync: None,
    })
}

async fn check_stale_peers(
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    events: broadcast::Sender<DiscoveryEvent>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(STALE_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stale_before = Utc::now()
            - chrono::Duration::from_std(STALE_AFTER).unwrap_or(chrono::Duration::seconds(30));
        let lost: Vec<String> = {
            let mut peers = peers.write();
            peers
                .values_mut()
                .filter(|peer| peer.status == PeerStatus::Online && peer.last_seen < stale_before)
                .map(|peer| {
                    peer.status = PeerStatus::Offline;
                    peer.id.clone()
                })
                .collect()
        };

        for device_id in lost {
            warn!(id = %device_id, "peer went stale");
            let _ = events.send(DiscoveryEvent::PeerLost(device_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_starts_empty() {
        let discovery = Discovery::new("dev-1", "Test Device", 52525, CancellationToken::new());
        assert!(discovery.get_peers().is_empty());
        assert!(discovery.get_peer("other").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let discovery = Discovery::new("dev-1", "Test Device", 52525, CancellationToken::new());
        let mut receiver = discovery.subscribe();

        let peer = Peer::new("dev-2", "Other");
        discovery
            .peers
            .write()
            .insert(peer.id.clone(), peer.clone());
        discovery
            .events
            .send(DiscoveryEvent::PeerFound(peer))
            .unwrap();

        match receiver.recv().await.unwrap() {
            DiscoveryEvent::PeerFound(found) => assert_eq!(found.id, "dev-2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
