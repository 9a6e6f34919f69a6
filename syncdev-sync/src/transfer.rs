//! Chunked file transfer
//!
//! The sender streams a file as base64-encoded chunks of at most 1 MiB and
//! marks the terminal chunk with `is_last`. The receiver writes into a
//! `<dest>.syncdev.tmp` sibling and only renames over the destination after
//! the final chunk has been fsynced, so the destination path never holds a
//! partial file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::prelude::*;
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, trace};

use syncdev_net::PeerConnection;
use syncdev_proto::{FileChunk, Message, MessageType, CHUNK_SIZE};

use crate::errors::{Result, SyncError};

/// Suffix appended to the destination path while a file is being received.
pub const TEMP_SUFFIX: &str = ".syncdev.tmp";

/// Progress of a single file transfer. `bytes_per_second` is the average
/// since the transfer started.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub file_name: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub percentage: f64,
    pub bytes_per_second: u64,
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

fn report_progress(
    callback: Option<&ProgressCallback>,
    file_name: &str,
    total: u64,
    transferred: u64,
    started: Instant,
) {
    let Some(callback) = callback else {
        return;
    };
    let elapsed = started.elapsed().as_secs_f64();
    let bytes_per_second = if elapsed > 0.0 {
        (transferred as f64 / elapsed) as u64
    } else {
        0
    };
    let percentage = if total > 0 {
        transferred as f64 / total as f64 * 100.0
    } else {
        100.0
    };
    callback(TransferProgress {
        file_name: file_name.to_string(),
        total_bytes: total,
        transferred_bytes: transferred,
        percentage,
        bytes_per_second,
    });
}

/// Stream a file to the peer in chunks. A terminal `is_last` chunk is always
/// sent, including for empty files and files whose size is an exact multiple
/// of the chunk size.
pub async fn send_file(
    conn: &PeerConnection,
    folder_pair_id: &str,
    root: impl AsRef<Path>,
    rel_path: &str,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    let full_path = root.as_ref().join(rel_path);
    let mut file = File::open(&full_path).await?;
    let total = file.metadata().await?.len();

    let started = Instant::now();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut offset: u64 = 0;

    loop {
        let n = file.read(&mut buffer).await?;
        let is_last = n < buffer.len();

        let chunk = FileChunk {
            folder_pair_id: folder_pair_id.to_string(),
            file_path: rel_path.to_string(),
            offset,
            data: BASE64_STANDARD.encode(&buffer[..n]),
            is_last,
        };
        conn.send(Message::new(MessageType::FileChunk, &chunk)?)
            .await?;

        offset += n as u64;
        trace!(path = rel_path, offset, is_last, "chunk sent");
        report_progress(progress.as_ref(), rel_path, total, offset, started);

        if is_last {
            break;
        }
    }

    debug!(path = rel_path, bytes = offset, "file sent");
    Ok(())
}

/// Receives the chunks of one file and commits them atomically.
///
/// A receiver is identified by `(folder_pair_id, rel_path)` and is
/// single-writer. The only terminal transitions are [`finalize`]
/// (fsync + rename over the destination) and [`abort`] (close + unlink the
/// temp file).
///
/// [`finalize`]: FileReceiver::finalize
/// [`abort`]: FileReceiver::abort
pub struct FileReceiver {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    expected_size: u64,
    received: u64,
    started: Instant,
    rel_path: String,
    progress: Option<ProgressCallback>,
}

impl FileReceiver {
    /// Open the temp file and create missing parent directories.
    pub async fn create(
        root: impl AsRef<Path>,
        rel_path: &str,
        expected_size: u64,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let final_path = root.as_ref().join(rel_path);
        let mut temp_os = final_path.clone().into_os_string();
        temp_os.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_os);

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&temp_path).await?;

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            expected_size,
            received: 0,
            started: Instant::now(),
            rel_path: rel_path.to_string(),
            progress,
        })
    }

    /// Decode and write one chunk at its offset. Chunks may arrive out of
    /// order.
    pub async fn write_chunk(&mut self, data: &str, offset: u64) -> Result<()> {
        let decoded = BASE64_STANDARD
            .decode(data)
            .map_err(|err| SyncError::TransferFailed(format!("chunk decode: {err}")))?;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SyncError::TransferFailed("receiver already closed".to_string()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&decoded).await?;

        self.received += decoded.len() as u64;
        report_progress(
            self.progress.as_ref(),
            &self.rel_path,
            self.expected_size,
            self.received,
            self.started,
        );
        Ok(())
    }

    /// Sync, close, and rename the temp file over the destination.
    pub async fn finalize(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| SyncError::TransferFailed("receiver already closed".to_string()))?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path).await?;
        debug!(path = %self.final_path.display(), bytes = self.received, "file received");
        Ok(())
    }

    /// Close and unlink the temp file, leaving the destination untouched.
    pub async fn abort(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
        }
        let _ = fs::remove_file(&self.temp_path).await;
        debug!(path = %self.final_path.display(), "transfer aborted");
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }
}
