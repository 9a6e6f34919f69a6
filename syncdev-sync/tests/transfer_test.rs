//! Integration tests for chunked transfer over a real socket pair:
//! reassembly in offset order, atomic commit, and receiver abort.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use tokio::net::{TcpListener, TcpStream};

use syncdev_net::PeerConnection;
use syncdev_proto::{FileChunk, MessageType, CHUNK_SIZE};
use syncdev_sync::{send_file, FileReceiver, TEMP_SUFFIX};

/// Build a connected pair of peer connections over loopback.
async fn connection_pair() -> (Arc<PeerConnection>, Arc<PeerConnection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer_addr) = accept.await.unwrap();

    let client_conn = Arc::new(PeerConnection::new(client, addr));
    let server_conn = Arc::new(PeerConnection::new(server, peer_addr));

    // File chunks are only legal on paired connections
    client_conn.arm_secret("test-secret").await;
    server_conn.arm_secret("test-secret").await;
    (client_conn, server_conn)
}

/// Drain chunk messages from `conn` into a receiver rooted at `root` until
/// the terminal chunk arrives, then finalize.
async fn receive_file(conn: &PeerConnection, root: &Path, rel_path: &str, expected: u64) {
    let mut receiver = FileReceiver::create(root, rel_path, expected, None)
        .await
        .unwrap();
    loop {
        let msg = conn.read_message().await.unwrap();
        assert_eq!(msg.msg_type, MessageType::FileChunk);
        let chunk: FileChunk = msg.parse_payload().unwrap();
        receiver.write_chunk(&chunk.data, chunk.offset).await.unwrap();
        if chunk.is_last {
            break;
        }
    }
    receiver.finalize().await.unwrap();
}

#[tokio::test]
async fn test_small_file_roundtrip() {
    let (sender, receiver_conn) = connection_pair().await;
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();

    tokio::fs::write(src.path().join("hello.txt"), b"hi\n")
        .await
        .unwrap();

    let src_root = src.path().to_path_buf();
    let push = tokio::spawn(async move {
        send_file(&sender, "pair-1", &src_root, "hello.txt", None)
            .await
            .unwrap();
    });

    receive_file(&receiver_conn, dst.path(), "hello.txt", 3).await;
    push.await.unwrap();

    let contents = tokio::fs::read(dst.path().join("hello.txt")).await.unwrap();
    assert_eq!(contents, b"hi\n");
}

#[tokio::test]
async fn test_multi_chunk_file_reassembles() {
    let (sender, receiver_conn) = connection_pair().await;
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();

    // Two full chunks plus a partial third
    let size = CHUNK_SIZE * 2 + 4096;
    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(src.path().join("big.bin"), &payload)
        .await
        .unwrap();

    let src_root = src.path().to_path_buf();
    let push = tokio::spawn(async move {
        send_file(&sender, "pair-1", &src_root, "big.bin", None)
            .await
            .unwrap();
    });

    receive_file(&receiver_conn, dst.path(), "big.bin", size as u64).await;
    push.await.unwrap();

    let contents = tokio::fs::read(dst.path().join("big.bin")).await.unwrap();
    assert_eq!(contents, payload);
}

#[tokio::test]
async fn test_exact_chunk_multiple_still_terminates() {
    let (sender, receiver_conn) = connection_pair().await;
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();

    let payload = vec![0xabu8; CHUNK_SIZE];
    tokio::fs::write(src.path().join("exact.bin"), &payload)
        .await
        .unwrap();

    let src_root = src.path().to_path_buf();
    let push = tokio::spawn(async move {
        send_file(&sender, "pair-1", &src_root, "exact.bin", None)
            .await
            .unwrap();
    });

    receive_file(&receiver_conn, dst.path(), "exact.bin", CHUNK_SIZE as u64).await;
    push.await.unwrap();

    let contents = tokio::fs::read(dst.path().join("exact.bin")).await.unwrap();
    assert_eq!(contents, payload);
}

#[tokio::test]
async fn test_empty_file_roundtrip() {
    let (sender, receiver_conn) = connection_pair().await;
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();

    tokio::fs::write(src.path().join("empty.txt"), b"").await.unwrap();

    let src_root = src.path().to_path_buf();
    let push = tokio::spawn(async move {
        send_file(&sender, "pair-1", &src_root, "empty.txt", None)
            .await
            .unwrap();
    });

    receive_file(&receiver_conn, dst.path(), "empty.txt", 0).await;
    push.await.unwrap();

    let meta = tokio::fs::metadata(dst.path().join("empty.txt")).await.unwrap();
    assert_eq!(meta.len(), 0);
}

#[tokio::test]
async fn test_destination_absent_until_final_chunk() {
    let dst = tempdir().unwrap();
    let final_path = dst.path().join("nested/dir/file.bin");

    let mut receiver = FileReceiver::create(dst.path(), "nested/dir/file.bin", 8, None)
        .await
        .unwrap();

    let data = base64_encode(b"partial!");
    receiver.write_chunk(&data, 0).await.unwrap();

    // Data written but not finalized: only the temp sibling exists
    assert!(!final_path.exists());
    let temp_name = format!("file.bin{TEMP_SUFFIX}");
    assert!(dst.path().join("nested/dir").join(&temp_name).exists());

    receiver.finalize().await.unwrap();
    assert!(final_path.exists());
    assert!(!dst.path().join("nested/dir").join(&temp_name).exists());
}

#[tokio::test]
async fn test_abort_leaves_no_artifacts() {
    let dst = tempdir().unwrap();
    let mut receiver = FileReceiver::create(dst.path(), "foo.bin", 100, None)
        .await
        .unwrap();

    receiver
        .write_chunk(&base64_encode(&[1u8; 64]), 0)
        .await
        .unwrap();
    receiver.abort().await;

    assert!(!dst.path().join("foo.bin").exists());
    assert!(!dst.path().join(format!("foo.bin{TEMP_SUFFIX}")).exists());
}

#[tokio::test]
async fn test_abort_preserves_existing_destination() {
    let dst = tempdir().unwrap();
    tokio::fs::write(dst.path().join("keep.txt"), b"original")
        .await
        .unwrap();

    let mut receiver = FileReceiver::create(dst.path(), "keep.txt", 100, None)
        .await
        .unwrap();
    receiver
        .write_chunk(&base64_encode(b"replacement"), 0)
        .await
        .unwrap();
    receiver.abort().await;

    let contents = tokio::fs::read(dst.path().join("keep.txt")).await.unwrap();
    assert_eq!(contents, b"original");
}

#[tokio::test]
async fn test_out_of_order_chunks() {
    let dst = tempdir().unwrap();
    let mut receiver = FileReceiver::create(dst.path(), "ooo.bin", 8, None)
        .await
        .unwrap();

    receiver
        .write_chunk(&base64_encode(b"world"), 3)
        .await
        .unwrap();
    receiver
        .write_chunk(&base64_encode(b"hel"), 0)
        .await
        .unwrap();
    receiver.finalize().await.unwrap();

    let contents = tokio::fs::read(dst.path().join("ooo.bin")).await.unwrap();
    assert_eq!(contents, b"helworld");
}

fn base64_encode(data: &[u8]) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(data)
}
