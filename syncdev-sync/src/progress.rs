//! Multi-file progress aggregation
//!
//! Folds per-chunk progress callbacks from many concurrent transfers into
//! aggregate snapshots for the UI. Emissions are throttled to roughly 15 Hz;
//! an update landing inside the throttle window schedules one trailing emit
//! so bursts coalesce. Speed is exponentially smoothed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Minimum spacing between throttled emissions (~15 Hz).
const EMIT_INTERVAL: Duration = Duration::from_millis(66);

/// Exponential smoothing factor (closer to 0 is smoother).
const SMOOTHING_ALPHA: f64 = 0.1;

/// Minimum completion percentage before an ETA is reported.
const MIN_PROGRESS_FOR_ETA: f64 = 5.0;

/// Cap on the number of active files included in a snapshot.
const MAX_ACTIVE_FILES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Active,
    Pending,
    Complete,
}

/// Progress of one file inside an aggregate snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub path: String,
    pub size: u64,
    pub transferred: u64,
    pub percentage: f64,
    pub status: FileStatus,
}

/// Aggregate progress across all files of a sync session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateProgress {
    pub status: SyncPhase,
    pub total_files: usize,
    pub completed_files: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub percentage: f64,
    /// Exponentially smoothed transfer speed.
    pub bytes_per_second: f64,
    /// Seconds remaining, -1 if unknown.
    pub eta: i64,
    /// At most ten currently active files.
    pub active_files: Vec<FileProgress>,
}

pub type AggregateCallback = Arc<dyn Fn(AggregateProgress) + Send + Sync>;

struct FileState {
    size: u64,
    transferred: u64,
    status: FileStatus,
}

struct AggregatorState {
    status: SyncPhase,
    total_files: usize,
    total_bytes: u64,
    files: HashMap<String, FileState>,
    completed_files: usize,
    completed_bytes: u64,
    smoothed_speed: f64,
    last_update: Instant,
    last_emit: Option<Instant>,
    trailing_emit: Option<JoinHandle<()>>,
}

impl AggregatorState {
    fn new() -> Self {
        Self {
            status: SyncPhase::Idle,
            total_files: 0,
            total_bytes: 0,
            files: HashMap::new(),
            completed_files: 0,
            completed_bytes: 0,
            smoothed_speed: 0.0,
            last_update: Instant::now(),
            last_emit: None,
            trailing_emit: None,
        }
    }

    fn update_speed(&mut self, byte_delta: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = byte_delta as f64 / elapsed;
            if self.smoothed_speed == 0.0 {
                self.smoothed_speed = instant_speed;
            } else {
                self.smoothed_speed =
                    SMOOTHING_ALPHA * instant_speed + (1.0 - SMOOTHING_ALPHA) * self.smoothed_speed;
            }
        }
        self.last_update = now;
    }

    fn build_progress(&self) -> AggregateProgress {
        let mut transferred = self.completed_bytes;
        let mut active_files = Vec::new();

        for (path, file) in &self.files {
            // Completed files are already accounted for in completed_bytes
            if file.status != FileStatus::Complete {
                transferred += file.transferred;
            }

            if file.status == FileStatus::Active && active_files.len() < MAX_ACTIVE_FILES {
                let percentage = if file.size > 0 {
                    file.transferred as f64 / file.size as f64 * 100.0
                } else {
                    0.0
                };
                active_files.push(FileProgress {
                    path: path.clone(),
                    size: file.size,
                    transferred: file.transferred,
                    percentage,
                    status: file.status,
                });
            }
        }

        let percentage = if self.total_bytes > 0 {
            transferred as f64 / self.total_bytes as f64 * 100.0
        } else {
            0.0
        };

        let mut eta: i64 = -1;
        if self.smoothed_speed > 0.0 && percentage >= MIN_PROGRESS_FOR_ETA {
            let remaining = self.total_bytes.saturating_sub(transferred);
            eta = if remaining > 0 {
                (remaining as f64 / self.smoothed_speed) as i64
            } else {
                0
            };
        }

        AggregateProgress {
            status: self.status,
            total_files: self.total_files,
            completed_files: self.completed_files,
            total_bytes: self.total_bytes,
            transferred_bytes: transferred,
            percentage,
            bytes_per_second: self.smoothed_speed,
            eta,
            active_files,
        }
    }
}

/// Collects per-file progress and emits throttled aggregate updates.
pub struct ProgressAggregator {
    state: Arc<Mutex<AggregatorState>>,
    callback: AggregateCallback,
}

impl ProgressAggregator {
    pub fn new(callback: AggregateCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(AggregatorState::new())),
            callback,
        }
    }

    /// Begin a sync session. Resets all per-file state and forces an emit.
    pub fn start(&self, total_files: usize, total_bytes: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            if let Some(handle) = state.trailing_emit.take() {
                handle.abort();
            }
            *state = AggregatorState::new();
            state.status = SyncPhase::Syncing;
            state.total_files = total_files;
            state.total_bytes = total_bytes;
            state.last_emit = Some(Instant::now());
            state.build_progress()
        };
        (self.callback)(snapshot);
    }

    /// Update progress for one file, emitting subject to the throttle.
    pub fn update_file(&self, path: &str, size: u64, transferred: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            let file = state.files.entry(path.to_string()).or_insert(FileState {
                size,
                transferred: 0,
                status: FileStatus::Active,
            });
            file.size = size;
            let delta = transferred.saturating_sub(file.transferred);
            file.transferred = transferred;
            file.status = if size > 0 && transferred >= size {
                FileStatus::Complete
            } else {
                FileStatus::Active
            };

            if delta > 0 {
                state.update_speed(delta);
            }
            self.throttled_emit(&mut state)
        };
        if let Some(snapshot) = snapshot {
            (self.callback)(snapshot);
        }
    }

    /// Mark a file complete, bump the session counters, and force an emit.
    pub fn complete_file(&self, path: &str, size: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            let file = state.files.entry(path.to_string()).or_insert(FileState {
                size,
                transferred: size,
                status: FileStatus::Complete,
            });
            file.transferred = file.size;
            file.status = FileStatus::Complete;
            state.completed_files += 1;
            state.completed_bytes += size;
            state.last_emit = Some(Instant::now());
            state.build_progress()
        };
        (self.callback)(snapshot);
    }

    /// End the session: cancel any trailing emit and emit a final
    /// `complete` snapshot.
    pub fn end(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if let Some(handle) = state.trailing_emit.take() {
                handle.abort();
            }
            state.status = SyncPhase::Complete;
            state.last_emit = Some(Instant::now());
            state.build_progress()
        };
        (self.callback)(snapshot);
    }

    /// Current snapshot without emitting.
    pub fn snapshot(&self) -> AggregateProgress {
        self.state.lock().build_progress()
    }

    /// Drop all session state and return to idle without emitting.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.trailing_emit.take() {
            handle.abort();
        }
        *state = AggregatorState::new();
    }

    /// Emit now if the throttle window has passed; otherwise schedule one
    /// trailing emit that coalesces the burst. Returns the snapshot to
    /// dispatch after the lock is released.
    fn throttled_emit(&self, state: &mut AggregatorState) -> Option<AggregateProgress> {
        let now = Instant::now();
        let since_last = state.last_emit.map(|at| now.duration_since(at));

        if since_last.map_or(true, |elapsed| elapsed >= EMIT_INTERVAL) {
            state.last_emit = Some(now);
            return Some(state.build_progress());
        }

        if state.trailing_emit.is_none() {
            let delay = EMIT_INTERVAL - since_last.unwrap_or(Duration::ZERO);
            let shared = Arc::clone(&self.state);
            let callback = Arc::clone(&self.callback);
            state.trailing_emit = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let snapshot = {
                    let mut state = shared.lock();
                    state.trailing_emit = None;
                    state.last_emit = Some(Instant::now());
                    state.build_progress()
                };
                callback(snapshot);
            }));
        }
        None
    }
}
