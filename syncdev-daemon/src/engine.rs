//! The sync engine facade
//!
//! Owns every component and drives the sync lifecycle: discovery events,
//! inbound protocol messages, pairing, per-pair sync runs, transfers, and
//! the activity log. The engine implements [`ConnectionHandler`] so the
//! transport dispatches straight into it; the embedding UI observes it
//! through the [`EngineEvents`] capability it supplied at construction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use syncdev_index::{FileIndex, FileInfo, IndexStore, Scanner};
use syncdev_net::server::install_connection;
use syncdev_net::{
    run_read_loop, Client, ConnectionHandler, ConnectionRegistry, PeerConnection, Server,
};
use syncdev_proto::{
    generate_shared_secret, DeleteFile, ErrorPayload, FileChunk, FileComplete, FileRequest,
    FileResponse, FolderPairSync, IndexExchange, Message, MessageType, PairingRequest,
    PairingResponse, SyncRequest, SyncResponse,
};
use syncdev_sync::{
    diff, send_file, AggregateProgress, FileReceiver, ProgressAggregator, ProgressCallback,
    SyncAction, SyncScheduler, TransferProgress, MAX_INTERVAL_MINS, MIN_INTERVAL_MINS,
};

use crate::config::{FolderPair, Peer, PeerStatus, APP_VERSION};
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::errors::{EngineError, Result};
use crate::events::{EngineEvents, SyncEvent, SyncEventKind, SyncStatus};
use crate::pairing::{PairingController, PairingValidation};
use crate::secrets::SecretStore;
use crate::store::ConfigStore;

const MAX_RECENT_EVENTS: usize = 100;

/// Suffix under which the peer's last received index is persisted, as the
/// baseline for [`Engine::analyze`].
const REMOTE_INDEX_SUFFIX: &str = "_remote";

type ReceiverKey = (String, String);

/// What a sync of one folder pair would do, without doing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPreview {
    pub folder_pair_id: String,
    pub peer_name: String,
    pub local_path: String,
    pub remote_path: String,
    pub to_push: Vec<FileInfo>,
    pub to_pull: Vec<FileInfo>,
    pub to_delete: Vec<FileInfo>,
    pub push_count: usize,
    pub pull_count: usize,
    pub delete_count: usize,
    pub push_size: u64,
    pub pull_size: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl SyncPreview {
    fn new(pair: &FolderPair, peer_name: &str) -> Self {
        Self {
            folder_pair_id: pair.id.clone(),
            peer_name: peer_name.to_string(),
            local_path: pair.local_path.clone(),
            remote_path: pair.remote_path.clone(),
            to_push: Vec::new(),
            to_pull: Vec::new(),
            to_delete: Vec::new(),
            push_count: 0,
            pull_count: 0,
            delete_count: 0,
            push_size: 0,
            pull_size: 0,
            error: String::new(),
        }
    }
}

/// The sync engine.
pub struct Engine {
    config: Arc<ConfigStore>,
    secrets: Arc<dyn SecretStore>,
    events: Arc<dyn EngineEvents>,

    index_store: Arc<IndexStore>,
    registry: Arc<ConnectionRegistry>,
    client: Client,
    discovery: Arc<Discovery>,
    pairing: PairingController,
    scheduler: SyncScheduler,
    aggregator: Arc<ProgressAggregator>,

    status: Mutex<(SyncStatus, String)>,
    recent_events: Mutex<VecDeque<SyncEvent>>,
    receivers: Mutex<HashMap<ReceiverKey, Arc<AsyncMutex<FileReceiver>>>>,
    /// Pairs currently being synced; the same pair never syncs twice at once.
    syncing_pairs: Mutex<HashSet<String>>,
    /// Pairs for which we initiated the exchange and expect the peer's index
    /// back. Gates the reply so two initiators do not ping-pong forever.
    awaiting_reply: Mutex<HashSet<String>>,

    shutdown: CancellationToken,
}

impl Engine {
    pub async fn new(
        config: Arc<ConfigStore>,
        secrets: Arc<dyn SecretStore>,
        events: Arc<dyn EngineEvents>,
    ) -> Result<Arc<Self>> {
        let cfg = config.get();
        let index_store = Arc::new(IndexStore::open(config.index_dir()).await?);
        let shutdown = CancellationToken::new();

        let aggregator = {
            let events = events.clone();
            Arc::new(ProgressAggregator::new(Arc::new(move |progress| {
                events.aggregate_progress(&progress);
            })))
        };

        let discovery = Arc::new(Discovery::new(
            cfg.device_id.clone(),
            cfg.device_name.clone(),
            cfg.port,
            shutdown.clone(),
        ));

        Ok(Arc::new(Self {
            client: Client::new(cfg.device_id.clone(), cfg.device_name.clone(), APP_VERSION),
            config,
            secrets,
            events,
            index_store,
            registry: Arc::new(ConnectionRegistry::new()),
            discovery,
            pairing: PairingController::new(),
            scheduler: SyncScheduler::new(),
            aggregator,
            status: Mutex::new((SyncStatus::Idle, String::new())),
            recent_events: Mutex::new(VecDeque::new()),
            receivers: Mutex::new(HashMap::new()),
            syncing_pairs: Mutex::new(HashSet::new()),
            awaiting_reply: Mutex::new(HashSet::new()),
            shutdown,
        }))
    }

    /// Start the server, discovery, and (if enabled) the auto-sync
    /// scheduler. Failing to bind the listen port is fatal; a discovery
    /// failure is logged and the engine keeps running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let cfg = self.config.get();

        let handler: Arc<dyn ConnectionHandler> = self.clone();
        let server = Server::new(cfg.port, self.registry.clone(), handler, self.shutdown.clone());
        server.start().await?;

        if let Err(err) = self.discovery.start() {
            warn!(%err, "discovery failed to start, continuing without it");
        }
        self.spawn_discovery_pump();

        if cfg.auto_sync {
            self.restart_scheduler();
        }

        info!(device = %cfg.device_name, "sync engine started");
        Ok(())
    }

    /// Stop every loop and close every connection.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.scheduler.stop();
        self.discovery.stop();

        for conn in self.registry.drain().await {
            conn.close().await;
        }
        info!("sync engine stopped");
    }

    fn spawn_discovery_pump(self: &Arc<Self>) {
        let mut receiver = self.discovery.subscribe();
        let events = self.events.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    },
                };
                match event {
                    DiscoveryEvent::PeerFound(peer) => {
                        debug!(peer = %peer.name, "peer found");
                        // Remember name/address of peers we already know
                        let _ = config.update(|c| {
                            if let Some(known) = c.get_peer_mut(&peer.id) {
                                known.host = peer.host.clone();
                                known.port = peer.port;
                                known.last_seen = peer.last_seen;
                            }
                        });
                        events.peers_changed();
                    }
                    DiscoveryEvent::PeerLost(_) => events.peers_changed(),
                    DiscoveryEvent::PeerUpdated(_) => {}
                }
            }
        });
    }

    // ----- configuration surface -----

    pub fn set_device_name(&self, name: &str) -> Result<()> {
        self.config.update(|c| c.device_name = name.to_string())
    }

    pub fn set_sync_interval(self: &Arc<Self>, minutes: u32) -> Result<()> {
        let minutes = minutes.clamp(MIN_INTERVAL_MINS, MAX_INTERVAL_MINS);
        self.config.update(|c| c.sync_interval_mins = minutes)?;
        self.restart_scheduler();
        Ok(())
    }

    pub fn set_auto_sync(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.config.update(|c| c.auto_sync = enabled)?;
        self.restart_scheduler();
        Ok(())
    }

    pub fn set_global_exclusions(&self, patterns: Vec<String>) -> Result<()> {
        self.config.update(|c| c.global_exclusions = patterns)
    }

    /// Stop the current scheduler driver and start a new one reflecting the
    /// current interval and auto-sync flag.
    pub fn restart_scheduler(self: &Arc<Self>) {
        let cfg = self.config.get();
        if !cfg.auto_sync {
            self.scheduler.stop();
            return;
        }
        let engine = Arc::clone(self);
        self.scheduler.restart(cfg.sync_interval_mins, move || {
            let engine = engine.clone();
            async move {
                if engine.config.get().auto_sync {
                    engine.sync_all().await;
                }
            }
        });
    }

    // ----- peers and pairing -----

    /// Discovered peers merged with their pairing state from config.
    pub fn list_peers(&self) -> Vec<Peer> {
        let cfg = self.config.get();
        let mut peers = self.discovery.get_peers();
        for peer in &mut peers {
            if let Some(known) = cfg.get_peer(&peer.id) {
                peer.paired = known.paired;
                peer.last_sync = known.last_sync;
            }
        }
        peers
    }

    pub fn generate_pairing_code(&self) -> String {
        self.pairing.generate_code()
    }

    pub fn clear_pairing_code(&self) {
        self.pairing.clear_code();
    }

    /// Dial the peer (if needed) and present a pairing code to it.
    pub async fn request_pairing(self: &Arc<Self>, peer_id: &str, code: &str) -> Result<()> {
        let peer = self
            .discovery
            .get_peer(peer_id)
            .ok_or_else(|| EngineError::PeerNotFound(peer_id.to_string()))?;
        let conn = self.ensure_connection(&peer).await?;
        self.client.send_pairing_request(&conn, code).await?;
        Ok(())
    }

    /// Accept a pending pairing request from a connected peer without a
    /// code exchange (explicit user consent on this device).
    pub async fn accept_pairing(&self, peer_id: &str) -> Result<()> {
        let conn = self
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| EngineError::ConnectionNotFound(peer_id.to_string()))?;

        let secret = generate_shared_secret();
        self.secrets.set(peer_id, &secret)?;
        let peer_name = conn.peer_name();
        self.config.update(|c| {
            let mut peer = c
                .get_peer(peer_id)
                .cloned()
                .unwrap_or_else(|| Peer::new(peer_id, peer_name.clone()));
            peer.paired = true;
            c.add_peer(peer);
        })?;

        conn.arm_secret(&secret).await;
        self.client
            .send_pairing_response(&conn, true, &secret, "")
            .await?;
        self.events.peers_changed();
        Ok(())
    }

    pub async fn reject_pairing(&self, peer_id: &str) -> Result<()> {
        let conn = self
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| EngineError::ConnectionNotFound(peer_id.to_string()))?;
        self.client
            .send_pairing_response(&conn, false, "", "Pairing rejected by user")
            .await?;
        Ok(())
    }

    /// Remove the pairing: drop the secret, forget the peer's folder pairs,
    /// and close any open connection.
    pub async fn unpair(&self, peer_id: &str) -> Result<()> {
        if let Err(err) = self.secrets.delete(peer_id) {
            warn!(peer_id, %err, "failed to delete secret");
        }

        self.config.update(|c| {
            if let Some(peer) = c.get_peer_mut(peer_id) {
                peer.paired = false;
            }
            c.folder_pairs.retain(|fp| fp.peer_id != peer_id);
        })?;

        if let Some(conn) = self.registry.get(peer_id).await {
            self.registry.remove(&conn).await;
            conn.close().await;
        }
        self.events.peers_changed();
        Ok(())
    }

    // ----- folder pairs -----

    pub fn list_pairs(&self) -> Vec<FolderPair> {
        self.config.get().folder_pairs
    }

    /// Create a folder pair and replicate it to the peer, which mirrors it
    /// with swapped paths.
    pub async fn add_pair(
        self: &Arc<Self>,
        peer_id: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Result<FolderPair> {
        let cfg = self.config.get();
        let peer = cfg
            .get_peer(peer_id)
            .ok_or_else(|| EngineError::PeerNotFound(peer_id.to_string()))?;
        if !peer.paired {
            return Err(EngineError::PeerNotFound(format!("{peer_id} (not paired)")));
        }

        let pair = FolderPair {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            enabled: true,
            exclusions: Vec::new(),
            last_sync: None,
        };
        self.config.update(|c| c.add_folder_pair(pair.clone()))?;

        if let Err(err) = self.send_folder_pair_sync(peer_id, &pair, "add").await {
            warn!(pair = %pair.id, %err, "failed to replicate folder pair to peer");
        }
        Ok(pair)
    }

    pub fn update_pair(&self, id: &str, enabled: bool, exclusions: Vec<String>) -> Result<()> {
        let mut found = false;
        self.config.update(|c| {
            if let Some(pair) = c.get_folder_pair_mut(id) {
                pair.enabled = enabled;
                pair.exclusions = exclusions;
                found = true;
            }
        })?;
        if found {
            Ok(())
        } else {
            Err(EngineError::FolderPairNotFound(id.to_string()))
        }
    }

    /// Remove a folder pair locally and on the peer.
    pub async fn remove_pair(self: &Arc<Self>, id: &str) -> Result<()> {
        let cfg = self.config.get();
        let pair = cfg
            .get_folder_pair(id)
            .ok_or_else(|| EngineError::FolderPairNotFound(id.to_string()))?
            .clone();

        self.config.update(|c| c.remove_folder_pair(id))?;
        if let Err(err) = self
            .send_folder_pair_sync(&pair.peer_id, &pair, "remove")
            .await
        {
            warn!(pair = id, %err, "failed to replicate folder pair removal");
        }
        Ok(())
    }

    async fn send_folder_pair_sync(
        self: &Arc<Self>,
        peer_id: &str,
        pair: &FolderPair,
        action: &str,
    ) -> Result<()> {
        let peer = self
            .discovery
            .get_peer(peer_id)
            .or_else(|| self.config.get().get_peer(peer_id).cloned())
            .ok_or_else(|| EngineError::PeerNotFound(peer_id.to_string()))?;

        let conn = self.ensure_connection(&peer).await?;
        let payload = FolderPairSync {
            folder_pair_id: pair.id.clone(),
            local_path: pair.local_path.clone(),
            remote_path: pair.remote_path.clone(),
            action: action.to_string(),
        };
        self.client.send_folder_pair_sync(&conn, &payload).await?;
        Ok(())
    }

    // ----- sync runs -----

    /// Sync every enabled folder pair whose peer is paired. Per-pair errors
    /// land in the event log; the run continues.
    pub async fn sync_all(self: &Arc<Self>) {
        let cfg = self.config.get();
        for pair in &cfg.folder_pairs {
            if !pair.enabled {
                continue;
            }
            let Some(peer) = cfg.get_peer(&pair.peer_id) else {
                continue;
            };
            if !peer.paired {
                continue;
            }

            if let Err(err) = self.sync_pair(&pair.id).await {
                error!(pair = %pair.id, %err, "sync failed");
                self.add_event(
                    SyncEvent::new(SyncEventKind::Error, format!("Sync failed: {err}"))
                        .folder_pair(&pair.id)
                        .peer_name(&peer.name),
                );
            }
        }
    }

    /// Run one sync for a folder pair: scan, connect, send our index, and
    /// persist it. The peer answers with its diff-driven pushes and
    /// requests.
    pub async fn sync_pair(self: &Arc<Self>, folder_pair_id: &str) -> Result<()> {
        {
            let mut syncing = self.syncing_pairs.lock();
            if !syncing.insert(folder_pair_id.to_string()) {
                return Err(EngineError::SyncInProgress(folder_pair_id.to_string()));
            }
        }

        let result = self.sync_pair_inner(folder_pair_id).await;
        self.syncing_pairs.lock().remove(folder_pair_id);

        if let Err(err) = &result {
            self.set_status(SyncStatus::Error, &err.to_string());
        }
        result
    }

    async fn sync_pair_inner(self: &Arc<Self>, folder_pair_id: &str) -> Result<()> {
        let cfg = self.config.get();
        let pair = cfg
            .get_folder_pair(folder_pair_id)
            .ok_or_else(|| EngineError::FolderPairNotFound(folder_pair_id.to_string()))?
            .clone();
        let mut peer = cfg
            .get_peer(&pair.peer_id)
            .ok_or_else(|| EngineError::PeerNotFound(pair.peer_id.clone()))?
            .clone();

        // The discovery view is fresher than the persisted record
        let discovered = self
            .discovery
            .get_peer(&pair.peer_id)
            .filter(|p| p.status == PeerStatus::Online)
            .ok_or_else(|| EngineError::PeerOffline(peer.name.clone()))?;
        peer.host = discovered.host;
        peer.port = discovered.port;
        peer.status = discovered.status;

        self.set_status(SyncStatus::Scanning, &format!("Scanning {}", pair.local_path));
        let scanner = self.scanner_for(&pair);
        let local_index = scanner.scan(&pair.local_path).await?;

        let conn = self.ensure_connection(&peer).await?;
        self.set_status(SyncStatus::Syncing, &format!("Syncing with {}", peer.name));

        self.awaiting_reply.lock().insert(pair.id.clone());
        self.client
            .send_sync_request(&conn, &pair.id, &pair.local_path, &pair.remote_path)
            .await?;
        self.client
            .send_index_exchange(&conn, &pair.id, local_index.files.clone())
            .await?;

        if let Err(err) = self.index_store.save(&pair.id, local_index).await {
            warn!(pair = %pair.id, %err, "failed to persist index");
        }
        self.config.update(|c| {
            if let Some(pair) = c.get_folder_pair_mut(folder_pair_id) {
                pair.last_sync = Some(Utc::now());
            }
        })?;

        self.set_status(SyncStatus::Idle, "");
        Ok(())
    }

    /// Compare a folder pair's local scan against the peer's last received
    /// index without transferring anything.
    pub async fn analyze(&self, folder_pair_id: &str) -> Result<SyncPreview> {
        let cfg = self.config.get();
        let pair = cfg
            .get_folder_pair(folder_pair_id)
            .ok_or_else(|| EngineError::FolderPairNotFound(folder_pair_id.to_string()))?;
        let peer = cfg
            .get_peer(&pair.peer_id)
            .ok_or_else(|| EngineError::PeerNotFound(pair.peer_id.clone()))?;

        let mut preview = SyncPreview::new(pair, &peer.name);

        let online = self
            .discovery
            .get_peer(&pair.peer_id)
            .map_or(false, |p| p.status == PeerStatus::Online);
        if !online {
            preview.error = "Peer is offline".to_string();
            return Ok(preview);
        }

        let scanner = self.scanner_for(pair);
        let local_index = match scanner.scan(&pair.local_path).await {
            Ok(index) => index,
            Err(err) => {
                preview.error = format!("Failed to scan local directory: {err}");
                return Ok(preview);
            }
        };

        let remote_key = format!("{}{}", pair.id, REMOTE_INDEX_SUFFIX);
        let Some(remote_index) = self.index_store.load(&remote_key).await? else {
            // Nothing received from the peer yet: everything local is new
            for info in local_index.files.values().filter(|f| !f.is_dir) {
                preview.push_size += info.size;
                preview.to_push.push(info.clone());
            }
            preview.push_count = preview.to_push.len();
            return Ok(preview);
        };

        for action in diff(&local_index, &remote_index) {
            match action {
                SyncAction::Push { local } if !local.is_dir => {
                    preview.push_size += local.size;
                    preview.to_push.push(local);
                }
                SyncAction::Pull { remote } if !remote.is_dir => {
                    preview.pull_size += remote.size;
                    preview.to_pull.push(remote);
                }
                SyncAction::Delete { local, remote } => {
                    if let Some(info) = local.or(remote) {
                        preview.to_delete.push(info);
                    }
                }
                _ => {}
            }
        }
        preview.push_count = preview.to_push.len();
        preview.pull_count = preview.to_pull.len();
        preview.delete_count = preview.to_delete.len();
        Ok(preview)
    }

    // ----- observers -----

    pub fn status(&self) -> (SyncStatus, String) {
        self.status.lock().clone()
    }

    pub fn aggregate_progress(&self) -> AggregateProgress {
        self.aggregator.snapshot()
    }

    pub fn recent_events(&self) -> Vec<SyncEvent> {
        self.recent_events.lock().iter().cloned().collect()
    }

    // ----- internals -----

    fn scanner_for(&self, pair: &FolderPair) -> Scanner {
        let cfg = self.config.get();
        let mut patterns = cfg.global_exclusions;
        patterns.extend(pair.exclusions.iter().cloned());
        Scanner::new(&patterns)
    }

    fn set_status(&self, status: SyncStatus, action: &str) {
        *self.status.lock() = (status, action.to_string());
        self.events.status_changed(status, action);
    }

    fn add_event(&self, event: SyncEvent) {
        {
            let mut events = self.recent_events.lock();
            events.push_front(event.clone());
            events.truncate(MAX_RECENT_EVENTS);
        }
        self.events.event_logged(&event);
    }

    /// Per-file progress callback feeding both the UI channel and the
    /// aggregator.
    fn transfer_progress_callback(&self) -> ProgressCallback {
        let events = self.events.clone();
        let aggregator = self.aggregator.clone();
        Arc::new(move |progress: TransferProgress| {
            events.transfer_progress(&progress);
            aggregator.update_file(
                &progress.file_name,
                progress.total_bytes,
                progress.transferred_bytes,
            );
        })
    }

    /// Reuse the registered connection for a peer or dial a new one. Dialed
    /// connections are armed with the stored secret for paired peers before
    /// their read loop starts.
    pub async fn ensure_connection(
        self: &Arc<Self>,
        peer: &Peer,
    ) -> Result<Arc<PeerConnection>> {
        if let Some(conn) = self.registry.get(&peer.id).await {
            return Ok(conn);
        }

        let conn = self.client.connect(&peer.host, peer.port).await?;
        conn.set_identity(&peer.id, &peer.name);
        if peer.paired {
            if let Some(secret) = self.secrets.get(&peer.id)? {
                conn.arm_secret(&secret).await;
            }
        }

        install_connection(&self.registry, conn.clone()).await;

        let registry = self.registry.clone();
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        let shutdown = self.shutdown.clone();
        let loop_conn = conn.clone();
        tokio::spawn(async move {
            run_read_loop(registry, loop_conn, handler, shutdown).await;
        });

        Ok(conn)
    }

    // ----- inbound message handlers -----

    async fn handle_pairing_request(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let request: PairingRequest = match msg.parse_payload() {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed pairing request");
                return;
            }
        };
        info!(peer = %request.device_name, "pairing request received");

        match self.pairing.validate(&request.code) {
            PairingValidation::NoCodeActive => {
                let _ = self
                    .client
                    .send_pairing_response(conn, false, "", "No pairing code active on this device")
                    .await;
            }
            PairingValidation::Mismatch => {
                warn!(peer = %request.device_name, "pairing code mismatch");
                let _ = self
                    .client
                    .send_pairing_response(conn, false, "", "Invalid pairing code")
                    .await;
            }
            PairingValidation::Accepted => {
                let secret = generate_shared_secret();
                if let Err(err) = self.secrets.set(&request.device_id, &secret) {
                    error!(%err, "failed to store shared secret");
                    let _ = self
                        .client
                        .send_pairing_response(conn, false, "", "Internal error")
                        .await;
                    return;
                }

                conn.set_identity(&request.device_id, &request.device_name);
                conn.arm_secret(&secret).await;

                let host = conn.remote_addr().ip().to_string();
                if let Err(err) = self.config.update(|c| {
                    let mut peer = c
                        .get_peer(&request.device_id)
                        .cloned()
                        .unwrap_or_else(|| {
                            Peer::new(request.device_id.clone(), request.device_name.clone())
                        });
                    peer.paired = true;
                    peer.host = host.clone();
                    c.add_peer(peer);
                }) {
                    error!(%err, "failed to persist peer");
                }

                let _ = self
                    .client
                    .send_pairing_response(conn, true, &secret, "")
                    .await;
                self.pairing.consume();
                self.events.peers_changed();
                info!(peer = %request.device_name, "pairing completed");
            }
        }
    }

    async fn handle_pairing_response(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let response: PairingResponse = match msg.parse_payload() {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "malformed pairing response");
                return;
            }
        };

        if !response.accepted {
            warn!(peer = %conn.peer_name(), reason = %response.error, "pairing rejected");
            self.events.peers_changed();
            return;
        }

        let peer_id = conn.peer_id();
        conn.arm_secret(&response.shared_secret).await;
        if let Err(err) = self.secrets.set(&peer_id, &response.shared_secret) {
            error!(%err, "failed to store shared secret");
        }
        let peer_name = conn.peer_name();
        if let Err(err) = self.config.update(|c| {
            let mut peer = c
                .get_peer(&peer_id)
                .cloned()
                .unwrap_or_else(|| Peer::new(peer_id.clone(), peer_name.clone()));
            peer.paired = true;
            c.add_peer(peer);
        }) {
            error!(%err, "failed to persist peer");
        }

        info!(peer = %conn.peer_name(), "pairing accepted by peer");
        self.events.peers_changed();
    }

    async fn handle_sync_request(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let request: SyncRequest = match msg.parse_payload() {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed sync request");
                return;
            }
        };

        let cfg = self.config.get();
        let accepted = cfg
            .get_folder_pair(&request.folder_pair_id)
            .map_or(false, |fp| fp.enabled);

        let response = SyncResponse {
            folder_pair_id: request.folder_pair_id,
            accepted,
            error: if accepted {
                String::new()
            } else {
                "Folder pair not found or disabled".to_string()
            },
        };
        if let Ok(msg) = Message::new(MessageType::SyncResponse, &response) {
            let _ = conn.send(msg).await;
        }
    }

    fn handle_sync_response(&self, msg: &Message) {
        let Ok(response) = msg.parse_payload::<SyncResponse>() else {
            return;
        };
        if !response.accepted {
            warn!(
                pair = %response.folder_pair_id,
                reason = %response.error,
                "sync rejected by peer"
            );
        }
    }

    /// The heart of a sync: the peer's index arrived. Diff it against our
    /// scan, push what we win, request what they win, and reply with our
    /// index unless this exchange is already the reply to one we initiated.
    async fn handle_index_exchange(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let exchange: IndexExchange = match msg.parse_payload() {
            Ok(exchange) => exchange,
            Err(err) => {
                warn!(%err, "malformed index exchange");
                return;
            }
        };

        let cfg = self.config.get();
        let Some(pair) = cfg.get_folder_pair(&exchange.folder_pair_id).cloned() else {
            warn!(pair = %exchange.folder_pair_id, "index exchange for unknown folder pair");
            return;
        };

        let initiated_by_us = self.awaiting_reply.lock().remove(&pair.id);

        let scanner = self.scanner_for(&pair);
        let local_index = match scanner.scan(&pair.local_path).await {
            Ok(index) => index,
            Err(err) => {
                error!(pair = %pair.id, %err, "failed to scan local directory");
                return;
            }
        };

        let mut remote_index = FileIndex::new(pair.remote_path.clone());
        remote_index.files = exchange.index;

        // Keep the peer's view as the baseline for analyze()
        let remote_key = format!("{}{}", pair.id, REMOTE_INDEX_SUFFIX);
        if let Err(err) = self.index_store.save(&remote_key, remote_index.clone()).await {
            warn!(pair = %pair.id, %err, "failed to persist remote index");
        }

        let actions = diff(&local_index, &remote_index);

        let mut total_files = 0usize;
        let mut total_bytes = 0u64;
        for action in &actions {
            match action {
                SyncAction::Push { local } if !local.is_dir => {
                    total_files += 1;
                    total_bytes += local.size;
                }
                SyncAction::Pull { remote } if !remote.is_dir => {
                    total_files += 1;
                    total_bytes += remote.size;
                }
                _ => {}
            }
        }

        if total_files > 0 {
            self.aggregator.start(total_files, total_bytes);
            self.events.sync_started();
        }

        for action in &actions {
            match action {
                SyncAction::Push { local } => self.push_file(conn, &pair, local).await,
                SyncAction::Pull { remote } => self.pull_file(conn, &pair, remote).await,
                _ => {}
            }
        }

        if total_files > 0 {
            self.aggregator.end();
            self.events.sync_ended();
        }

        // Answer with our index so the initiator can converge; an exchange
        // we initiated is already the answer.
        if !initiated_by_us {
            if let Err(err) = self
                .client
                .send_index_exchange(conn, &pair.id, local_index.files.clone())
                .await
            {
                warn!(pair = %pair.id, %err, "failed to send index reply");
            }
        }

        if let Err(err) = self.index_store.save(&pair.id, local_index).await {
            warn!(pair = %pair.id, %err, "failed to persist index");
        }
    }

    async fn push_file(&self, conn: &Arc<PeerConnection>, pair: &FolderPair, info: &FileInfo) {
        if info.is_dir {
            return;
        }

        let progress = self.transfer_progress_callback();
        match send_file(
            conn,
            &pair.id,
            Path::new(&pair.local_path),
            &info.path,
            Some(progress),
        )
        .await
        {
            Ok(()) => {
                self.aggregator.complete_file(&info.path, info.size);
                self.add_event(
                    SyncEvent::new(SyncEventKind::Push, "File sent")
                        .folder_pair(&pair.id)
                        .file_path(&info.path)
                        .peer_name(conn.peer_name()),
                );
            }
            Err(err) => {
                error!(path = %info.path, %err, "push failed");
                self.add_event(
                    SyncEvent::new(SyncEventKind::Error, format!("Push failed: {err}"))
                        .folder_pair(&pair.id)
                        .file_path(&info.path)
                        .peer_name(conn.peer_name()),
                );
            }
        }
    }

    async fn pull_file(&self, conn: &Arc<PeerConnection>, pair: &FolderPair, info: &FileInfo) {
        if info.is_dir {
            let dir_path = Path::new(&pair.local_path).join(&info.path);
            if let Err(err) = tokio::fs::create_dir_all(&dir_path).await {
                warn!(path = %info.path, %err, "failed to create directory");
                return;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let permissions = std::fs::Permissions::from_mode(info.permission);
                let _ = tokio::fs::set_permissions(&dir_path, permissions).await;
            }
            return;
        }

        if let Err(err) = self
            .client
            .send_file_request(conn, &pair.id, &info.path, 0)
            .await
        {
            warn!(path = %info.path, %err, "file request failed");
        }
    }

    async fn handle_file_request(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let request: FileRequest = match msg.parse_payload() {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed file request");
                return;
            }
        };

        let cfg = self.config.get();
        let Some(pair) = cfg.get_folder_pair(&request.folder_pair_id).cloned() else {
            return;
        };

        let scanner = self.scanner_for(&pair);
        let info = match scanner.file_info(&pair.local_path, &request.file_path).await {
            Ok(info) => info,
            Err(err) => {
                let response = FileResponse {
                    folder_pair_id: request.folder_pair_id,
                    file_path: request.file_path,
                    size: 0,
                    hash: String::new(),
                    error: err.to_string(),
                };
                if let Ok(msg) = Message::new(MessageType::FileResponse, &response) {
                    let _ = conn.send(msg).await;
                }
                return;
            }
        };

        let response = FileResponse {
            folder_pair_id: request.folder_pair_id.clone(),
            file_path: request.file_path.clone(),
            size: info.size,
            hash: info.hash.clone(),
            error: String::new(),
        };
        if let Ok(msg) = Message::new(MessageType::FileResponse, &response) {
            let _ = conn.send(msg).await;
        }

        self.push_file(conn, &pair, &info).await;
    }

    fn handle_file_response(&self, msg: &Message) {
        let Ok(response) = msg.parse_payload::<FileResponse>() else {
            return;
        };
        if !response.error.is_empty() {
            warn!(
                path = %response.file_path,
                error = %response.error,
                "peer could not serve file"
            );
            self.add_event(
                SyncEvent::new(
                    SyncEventKind::Error,
                    format!("Peer could not serve file: {}", response.error),
                )
                .folder_pair(&response.folder_pair_id)
                .file_path(&response.file_path),
            );
        }
    }

    async fn handle_file_chunk(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let chunk: FileChunk = match msg.parse_payload() {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(%err, "malformed file chunk");
                return;
            }
        };
        let key: ReceiverKey = (chunk.folder_pair_id.clone(), chunk.file_path.clone());

        let receiver = {
            let receivers = self.receivers.lock();
            receivers.get(&key).cloned()
        };
        let receiver = match receiver {
            Some(receiver) => receiver,
            None => {
                let cfg = self.config.get();
                let Some(pair) = cfg.get_folder_pair(&chunk.folder_pair_id).cloned() else {
                    return;
                };

                // The peer's last index tells us the expected size, when known
                let remote_key = format!("{}{}", pair.id, REMOTE_INDEX_SUFFIX);
                let expected = self
                    .index_store
                    .load(&remote_key)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|index| index.files.get(&chunk.file_path).map(|f| f.size))
                    .unwrap_or(0);

                let progress = self.transfer_progress_callback();
                let receiver = match FileReceiver::create(
                    Path::new(&pair.local_path),
                    &chunk.file_path,
                    expected,
                    Some(progress),
                )
                .await
                {
                    Ok(receiver) => Arc::new(AsyncMutex::new(receiver)),
                    Err(err) => {
                        error!(path = %chunk.file_path, %err, "failed to create receiver");
                        return;
                    }
                };
                self.receivers.lock().insert(key.clone(), receiver.clone());
                receiver
            }
        };

        let mut guard = receiver.lock().await;
        if let Err(err) = guard.write_chunk(&chunk.data, chunk.offset).await {
            error!(path = %chunk.file_path, %err, "chunk write failed");
            guard.abort().await;
            drop(guard);
            self.receivers.lock().remove(&key);
            self.add_event(
                SyncEvent::new(SyncEventKind::Error, format!("Receive failed: {err}"))
                    .folder_pair(&chunk.folder_pair_id)
                    .file_path(&chunk.file_path)
                    .peer_name(conn.peer_name()),
            );
            return;
        }

        if chunk.is_last {
            let received = guard.received();
            self.aggregator.complete_file(&chunk.file_path, received);

            match guard.finalize().await {
                Ok(()) => {
                    self.add_event(
                        SyncEvent::new(SyncEventKind::Pull, "File received")
                            .folder_pair(&chunk.folder_pair_id)
                            .file_path(&chunk.file_path)
                            .peer_name(conn.peer_name()),
                    );
                }
                Err(err) => {
                    error!(path = %chunk.file_path, %err, "finalize failed");
                    guard.abort().await;
                    self.add_event(
                        SyncEvent::new(SyncEventKind::Error, format!("Receive failed: {err}"))
                            .folder_pair(&chunk.folder_pair_id)
                            .file_path(&chunk.file_path)
                            .peer_name(conn.peer_name()),
                    );
                }
            }
            drop(guard);
            self.receivers.lock().remove(&key);
        }
    }

    fn handle_file_complete(&self, msg: &Message) {
        let Ok(complete) = msg.parse_payload::<FileComplete>() else {
            return;
        };
        if !complete.success {
            warn!(
                path = %complete.file_path,
                error = %complete.error,
                "peer reported failed transfer"
            );
        }
    }

    async fn handle_delete_file(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let request: DeleteFile = match msg.parse_payload() {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed delete request");
                return;
            }
        };

        let cfg = self.config.get();
        let Some(pair) = cfg.get_folder_pair(&request.folder_pair_id).cloned() else {
            return;
        };

        let full_path = Path::new(&pair.local_path).join(&request.file_path);
        let result = match tokio::fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full_path).await,
            Ok(_) => tokio::fs::remove_file(&full_path).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!(path = %request.file_path, %err, "delete failed");
            return;
        }

        if let Ok(ack) = Message::new(MessageType::DeleteAck, &request) {
            let _ = conn.send(ack).await;
        }
        self.add_event(
            SyncEvent::new(SyncEventKind::Delete, "File deleted")
                .folder_pair(&pair.id)
                .file_path(&request.file_path)
                .peer_name(conn.peer_name()),
        );
    }

    async fn handle_folder_pair_sync(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let payload: FolderPairSync = match msg.parse_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "malformed folder pair sync");
                return;
            }
        };
        info!(
            peer = %conn.peer_name(),
            action = %payload.action,
            pair = %payload.folder_pair_id,
            "folder pair sync received"
        );

        match payload.action.as_str() {
            "add" => {
                let peer_id = conn.peer_id();
                let result = self.config.update(|c| {
                    if c.get_folder_pair(&payload.folder_pair_id).is_some() {
                        debug!(pair = %payload.folder_pair_id, "folder pair already exists");
                        return;
                    }
                    // Mirror the pair: their remote is our local
                    c.add_folder_pair(FolderPair {
                        id: payload.folder_pair_id.clone(),
                        peer_id: peer_id.clone(),
                        local_path: payload.remote_path.clone(),
                        remote_path: payload.local_path.clone(),
                        enabled: true,
                        exclusions: Vec::new(),
                        last_sync: None,
                    });
                });
                if let Err(err) = result {
                    error!(%err, "failed to persist mirrored folder pair");
                }
            }
            "remove" => {
                if let Err(err) = self
                    .config
                    .update(|c| c.remove_folder_pair(&payload.folder_pair_id))
                {
                    error!(%err, "failed to remove folder pair");
                }
            }
            other => warn!(action = other, "unknown folder pair sync action"),
        }
        self.events.peers_changed();
    }

    fn handle_error(&self, conn: &Arc<PeerConnection>, msg: &Message) {
        let Ok(payload) = msg.parse_payload::<ErrorPayload>() else {
            return;
        };
        warn!(peer = %conn.peer_name(), code = %payload.code, "peer reported error");
        self.add_event(
            SyncEvent::new(
                SyncEventKind::Error,
                format!("Peer error [{}]: {}", payload.code, payload.message),
            )
            .peer_name(conn.peer_name()),
        );
    }
}

#[async_trait]
impl ConnectionHandler for Engine {
    async fn on_connect(&self, conn: Arc<PeerConnection>) {
        let peer_id = conn.peer_id();
        info!(peer = %conn.peer_name(), id = %peer_id, "peer connected");

        // A known-paired peer gets its secret armed before any application
        // message is read
        let cfg = self.config.get();
        if cfg.get_peer(&peer_id).map_or(false, |p| p.paired) {
            match self.secrets.get(&peer_id) {
                Ok(Some(secret)) => conn.arm_secret(&secret).await,
                Ok(None) => warn!(id = %peer_id, "paired peer has no stored secret"),
                Err(err) => warn!(id = %peer_id, %err, "failed to load secret"),
            }
        }

        self.events.peers_changed();
    }

    async fn on_disconnect(&self, conn: Arc<PeerConnection>) {
        let peer_id = conn.peer_id();
        info!(peer = %conn.peer_name(), id = %peer_id, "peer disconnected");

        // Abort in-flight receivers that belong to this peer's folder pairs
        let cfg = self.config.get();
        let affected: Vec<(ReceiverKey, Arc<AsyncMutex<FileReceiver>>)> = {
            let receivers = self.receivers.lock();
            receivers
                .iter()
                .filter(|((pair_id, _), _)| {
                    cfg.get_folder_pair(pair_id)
                        .map_or(false, |fp| fp.peer_id == peer_id)
                })
                .map(|(key, receiver)| (key.clone(), receiver.clone()))
                .collect()
        };
        for (key, receiver) in affected {
            receiver.lock().await.abort().await;
            self.receivers.lock().remove(&key);
        }

        self.events.peers_changed();
    }

    async fn handle_message(&self, conn: Arc<PeerConnection>, msg: Message) {
        match msg.msg_type {
            MessageType::PairingRequest => self.handle_pairing_request(&conn, &msg).await,
            MessageType::PairingResponse => self.handle_pairing_response(&conn, &msg).await,
            MessageType::SyncRequest => self.handle_sync_request(&conn, &msg).await,
            MessageType::SyncResponse => self.handle_sync_response(&msg),
            MessageType::IndexExchange => self.handle_index_exchange(&conn, &msg).await,
            MessageType::FileRequest => self.handle_file_request(&conn, &msg).await,
            MessageType::FileResponse => self.handle_file_response(&msg),
            MessageType::FileChunk => self.handle_file_chunk(&conn, &msg).await,
            MessageType::FileComplete => self.handle_file_complete(&msg),
            MessageType::DeleteFile => self.handle_delete_file(&conn, &msg).await,
            MessageType::DeleteAck => debug!(peer = %conn.peer_name(), "delete acknowledged"),
            MessageType::Ping => {
                let _ = self.client.send_pong(&conn).await;
            }
            MessageType::Pong => debug!(peer = %conn.peer_name(), "pong"),
            MessageType::Error => self.handle_error(&conn, &msg),
            MessageType::FolderPairSync => self.handle_folder_pair_sync(&conn, &msg).await,
            MessageType::Hello => debug!(peer = %conn.peer_name(), "redundant hello ignored"),
        }
    }
}
