//! Engine-level integration tests: pairing over a live socket pair, folder
//! pair mirroring, sync request acknowledgement, and a push flow driven by
//! an inbound index exchange.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::net::{TcpListener, TcpStream};

use syncdev_daemon::{
    ConfigStore, Engine, EngineEvents, FileSecretStore, FolderPair, Peer, SecretStore, SyncEvent,
    SyncEventKind,
};
use syncdev_net::{ConnectionHandler, PeerConnection};
use syncdev_proto::{
    IndexExchange, Message, MessageType, PairingRequest, PairingResponse, SyncRequest,
    SyncResponse,
};

#[derive(Default)]
struct CollectingEvents {
    events: Mutex<Vec<SyncEvent>>,
    sync_started: Mutex<usize>,
    sync_ended: Mutex<usize>,
}

impl EngineEvents for CollectingEvents {
    fn sync_started(&self) {
        *self.sync_started.lock().unwrap() += 1;
    }

    fn sync_ended(&self) {
        *self.sync_ended.lock().unwrap() += 1;
    }

    fn event_logged(&self, event: &SyncEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct TestEngine {
    engine: Arc<Engine>,
    config: Arc<ConfigStore>,
    secrets: Arc<FileSecretStore>,
    events: Arc<CollectingEvents>,
    _data_dir: TempDir,
}

async fn test_engine() -> TestEngine {
    let data_dir = tempdir().unwrap();
    let config = Arc::new(ConfigStore::open(data_dir.path()).unwrap());
    let secrets = Arc::new(FileSecretStore::open(config.secrets_dir()).unwrap());
    let events = Arc::new(CollectingEvents::default());
    let engine = Engine::new(config.clone(), secrets.clone(), events.clone())
        .await
        .unwrap();
    TestEngine {
        engine,
        config,
        secrets,
        events,
        _data_dir: data_dir,
    }
}

/// A connected socket pair wrapped as peer connections, with identities set
/// as if the hello exchange already happened.
async fn connection_pair(
    left_peer: (&str, &str),
    right_peer: (&str, &str),
) -> (Arc<PeerConnection>, Arc<PeerConnection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer_addr) = accept.await.unwrap();

    let left = Arc::new(PeerConnection::new(client, addr));
    let right = Arc::new(PeerConnection::new(server, peer_addr));
    left.set_identity(left_peer.0, left_peer.1);
    right.set_identity(right_peer.0, right_peer.1);
    (left, right)
}

#[tokio::test]
async fn test_pairing_flow_between_two_engines() {
    let a = test_engine().await;
    let b = test_engine().await;
    let a_id = a.config.get().device_id;
    let b_id = b.config.get().device_id;

    // conn_on_a sees peer B; conn_on_b sees peer A
    let (conn_on_b, conn_on_a) = connection_pair((&a_id, "A"), (&b_id, "B")).await;

    let code = a.engine.generate_pairing_code();

    // B's pairing request arrives at A
    let request = Message::new(
        MessageType::PairingRequest,
        &PairingRequest {
            device_id: b_id.clone(),
            device_name: "B".to_string(),
            code: code.clone(),
        },
    )
    .unwrap();
    a.engine.handle_message(conn_on_a.clone(), request).await;

    // A answered with the shared secret; feed it into B
    let response = conn_on_b.read_message().await.unwrap();
    assert_eq!(response.msg_type, MessageType::PairingResponse);
    let payload: PairingResponse = response.parse_payload().unwrap();
    assert!(payload.accepted);
    assert!(!payload.shared_secret.is_empty());

    b.engine.handle_message(conn_on_b.clone(), response).await;

    // Both sides hold the same secret and mark the peer paired
    let secret_on_a = a.secrets.get(&b_id).unwrap().unwrap();
    let secret_on_b = b.secrets.get(&a_id).unwrap().unwrap();
    assert_eq!(secret_on_a, secret_on_b);
    assert!(a.config.get().get_peer(&b_id).unwrap().paired);
    assert!(b.config.get().get_peer(&a_id).unwrap().paired);
    assert!(conn_on_a.is_paired());
    assert!(conn_on_b.is_paired());

    // The code was consumed: replaying it is rejected
    let replay = Message::new(
        MessageType::PairingRequest,
        &PairingRequest {
            device_id: "someone-else".to_string(),
            device_name: "C".to_string(),
            code,
        },
    )
    .unwrap();
    a.engine.handle_message(conn_on_a.clone(), replay).await;
    let response = conn_on_b.read_message().await.unwrap();
    let payload: PairingResponse = response.parse_payload().unwrap();
    assert!(!payload.accepted);
}

#[tokio::test]
async fn test_pairing_rejects_wrong_code_and_keeps_it() {
    let a = test_engine().await;
    let (conn_on_b, conn_on_a) = connection_pair(("a-id", "A"), ("b-id", "B")).await;

    let code = a.engine.generate_pairing_code();
    let wrong = if code == "000000" { "000001" } else { "000000" };

    let request = Message::new(
        MessageType::PairingRequest,
        &PairingRequest {
            device_id: "b-id".to_string(),
            device_name: "B".to_string(),
            code: wrong.to_string(),
        },
    )
    .unwrap();
    a.engine.handle_message(conn_on_a.clone(), request).await;

    let response = conn_on_b.read_message().await.unwrap();
    let payload: PairingResponse = response.parse_payload().unwrap();
    assert!(!payload.accepted);
    assert_eq!(payload.error, "Invalid pairing code");

    // A mismatch does not consume the code
    let request = Message::new(
        MessageType::PairingRequest,
        &PairingRequest {
            device_id: "b-id".to_string(),
            device_name: "B".to_string(),
            code,
        },
    )
    .unwrap();
    a.engine.handle_message(conn_on_a.clone(), request).await;
    let response = conn_on_b.read_message().await.unwrap();
    let payload: PairingResponse = response.parse_payload().unwrap();
    assert!(payload.accepted);
}

#[tokio::test]
async fn test_folder_pair_sync_mirrors_with_swapped_paths() {
    let a = test_engine().await;
    let (_conn_on_b, conn_on_a) = connection_pair(("a-id", "A"), ("b-id", "B")).await;

    let payload = syncdev_proto::FolderPairSync {
        folder_pair_id: "fp-1".to_string(),
        local_path: "/X".to_string(),
        remote_path: "/Y".to_string(),
        action: "add".to_string(),
    };
    let msg = Message::new(MessageType::FolderPairSync, &payload).unwrap();
    a.engine.handle_message(conn_on_a.clone(), msg).await;

    let config = a.config.get();
    let pair = config.get_folder_pair("fp-1").unwrap();
    assert_eq!(pair.local_path, "/Y");
    assert_eq!(pair.remote_path, "/X");
    assert_eq!(pair.peer_id, "b-id");
    assert!(pair.enabled);

    // A duplicate id is ignored
    let duplicate = syncdev_proto::FolderPairSync {
        folder_pair_id: "fp-1".to_string(),
        local_path: "/other".to_string(),
        remote_path: "/paths".to_string(),
        action: "add".to_string(),
    };
    let msg = Message::new(MessageType::FolderPairSync, &duplicate).unwrap();
    a.engine.handle_message(conn_on_a.clone(), msg).await;
    assert_eq!(a.config.get().get_folder_pair("fp-1").unwrap().local_path, "/Y");

    // Removal deletes by id
    let remove = syncdev_proto::FolderPairSync {
        folder_pair_id: "fp-1".to_string(),
        local_path: String::new(),
        remote_path: String::new(),
        action: "remove".to_string(),
    };
    let msg = Message::new(MessageType::FolderPairSync, &remove).unwrap();
    a.engine.handle_message(conn_on_a.clone(), msg).await;
    assert!(a.config.get().get_folder_pair("fp-1").is_none());
}

#[tokio::test]
async fn test_sync_request_acknowledged_only_for_enabled_pairs() {
    let a = test_engine().await;
    let (conn_on_b, conn_on_a) = connection_pair(("a-id", "A"), ("b-id", "B")).await;

    a.config
        .update(|c| {
            c.add_folder_pair(FolderPair {
                id: "fp-on".to_string(),
                peer_id: "b-id".to_string(),
                local_path: "/x".to_string(),
                remote_path: "/y".to_string(),
                enabled: true,
                exclusions: vec![],
                last_sync: None,
            });
            c.add_folder_pair(FolderPair {
                id: "fp-off".to_string(),
                peer_id: "b-id".to_string(),
                local_path: "/x".to_string(),
                remote_path: "/y".to_string(),
                enabled: false,
                exclusions: vec![],
                last_sync: None,
            });
        })
        .unwrap();

    for (pair_id, expect_accepted) in [("fp-on", true), ("fp-off", false), ("fp-nope", false)] {
        let msg = Message::new(
            MessageType::SyncRequest,
            &SyncRequest {
                folder_pair_id: pair_id.to_string(),
                local_path: "/y".to_string(),
                remote_path: "/x".to_string(),
            },
        )
        .unwrap();
        a.engine.handle_message(conn_on_a.clone(), msg).await;

        let response = conn_on_b.read_message().await.unwrap();
        assert_eq!(response.msg_type, MessageType::SyncResponse);
        let payload: SyncResponse = response.parse_payload().unwrap();
        assert_eq!(payload.folder_pair_id, pair_id);
        assert_eq!(payload.accepted, expect_accepted, "pair {pair_id}");
    }
}

#[tokio::test]
async fn test_index_exchange_pushes_missing_file_to_peer() {
    let a = test_engine().await;
    let b = test_engine().await;

    // A has hello.txt; B's side of the pair is empty
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();
    tokio::fs::write(a_dir.path().join("hello.txt"), b"hi\n")
        .await
        .unwrap();

    let secret = syncdev_proto::generate_shared_secret();
    for (engine, peer_id, local) in [
        (&a, "b-id", a_dir.path()),
        (&b, "a-id", b_dir.path()),
    ] {
        engine.secrets.set(peer_id, &secret).unwrap();
        engine
            .config
            .update(|c| {
                let mut peer = Peer::new(peer_id, "peer");
                peer.paired = true;
                c.add_peer(peer);
                c.add_folder_pair(FolderPair {
                    id: "fp-1".to_string(),
                    peer_id: peer_id.to_string(),
                    local_path: local.to_string_lossy().into_owned(),
                    remote_path: "/remote".to_string(),
                    enabled: true,
                    exclusions: vec![],
                    last_sync: None,
                });
            })
            .unwrap();
    }

    let (conn_on_b, conn_on_a) = connection_pair(("a-id", "A"), ("b-id", "B")).await;
    conn_on_a.arm_secret(&secret).await;
    conn_on_b.arm_secret(&secret).await;

    // B announces an empty index; A must push hello.txt and then reply with
    // its own index
    let exchange = Message::new(
        MessageType::IndexExchange,
        &IndexExchange {
            folder_pair_id: "fp-1".to_string(),
            index: Default::default(),
        },
    )
    .unwrap();
    let a_engine = a.engine.clone();
    let conn = conn_on_a.clone();
    let handle = tokio::spawn(async move {
        a_engine.handle_message(conn, exchange).await;
    });

    // Drain what A sends: file chunks feed engine B, the index reply ends
    // the exchange
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), conn_on_b.read_message())
            .await
            .expect("peer went quiet")
            .unwrap();
        match msg.msg_type {
            MessageType::FileChunk => b.engine.handle_message(conn_on_b.clone(), msg).await,
            MessageType::IndexExchange => break,
            other => panic!("unexpected message: {other}"),
        }
    }
    handle.await.unwrap();

    let contents = tokio::fs::read(b_dir.path().join("hello.txt")).await.unwrap();
    assert_eq!(contents, b"hi\n");

    // A logged the push, B logged the pull, and A ran one aggregate session
    assert!(a
        .events
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.kind == SyncEventKind::Push));
    assert!(b
        .events
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.kind == SyncEventKind::Pull));
    assert_eq!(*a.events.sync_started.lock().unwrap(), 1);
    assert_eq!(*a.events.sync_ended.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_analyze_reports_offline_peer() {
    let a = test_engine().await;
    a.config
        .update(|c| {
            let mut peer = Peer::new("b-id", "B");
            peer.paired = true;
            c.add_peer(peer);
            c.add_folder_pair(FolderPair {
                id: "fp-1".to_string(),
                peer_id: "b-id".to_string(),
                local_path: "/nowhere".to_string(),
                remote_path: "/remote".to_string(),
                enabled: true,
                exclusions: vec![],
                last_sync: None,
            });
        })
        .unwrap();

    let preview = a.engine.analyze("fp-1").await.unwrap();
    assert_eq!(preview.error, "Peer is offline");
    assert!(preview.to_push.is_empty());
}

#[tokio::test]
async fn test_unpair_drops_secret_and_pairs() {
    let a = test_engine().await;
    a.secrets.set("b-id", "secret").unwrap();
    a.config
        .update(|c| {
            let mut peer = Peer::new("b-id", "B");
            peer.paired = true;
            c.add_peer(peer);
            c.add_folder_pair(FolderPair {
                id: "fp-1".to_string(),
                peer_id: "b-id".to_string(),
                local_path: "/x".to_string(),
                remote_path: "/y".to_string(),
                enabled: true,
                exclusions: vec![],
                last_sync: None,
            });
        })
        .unwrap();

    a.engine.unpair("b-id").await.unwrap();

    assert!(a.secrets.get("b-id").unwrap().is_none());
    let config = a.config.get();
    assert!(!config.get_peer("b-id").unwrap().paired);
    assert!(config.folder_pairs.is_empty());
}
