//! Periodic auto-sync scheduler
//!
//! Drives `sync_all` at a configured interval. There is never more than one
//! driver: reconfiguration stops the current driver and starts a new one
//! under a single lock.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const MIN_INTERVAL_MINS: u32 = 1;
pub const MAX_INTERVAL_MINS: u32 = 60;

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct SyncScheduler {
    driver: Mutex<Option<Driver>>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop any running driver and start a new one ticking every
    /// `interval_mins` minutes (clamped to [1, 60]).
    pub fn restart<F, Fut>(&self, interval_mins: u32, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let interval_mins = interval_mins.clamp(MIN_INTERVAL_MINS, MAX_INTERVAL_MINS);
        let period = Duration::from_secs(u64::from(interval_mins) * 60);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("scheduler driver stopping");
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        });

        let mut driver = self.driver.lock();
        if let Some(old) = driver.replace(Driver { cancel, task }) {
            old.cancel.cancel();
        }
        info!(interval_mins, "scheduler started");
    }

    /// Stop the driver, if one is running.
    pub fn stop(&self) {
        let mut driver = self.driver.lock();
        if let Some(old) = driver.take() {
            old.cancel.cancel();
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let mut driver = self.driver.lock();
        match driver.as_ref() {
            Some(current) if current.task.is_finished() => {
                *driver = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_restart_keeps_a_single_driver() {
        let scheduler = SyncScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ticks = ticks.clone();
            scheduler.restart(5, move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert!(scheduler.is_running());

        scheduler.stop();
        // Give the drivers a moment to observe cancellation
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!scheduler.is_running());
        // No tick fired: the shortest interval is one minute
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_without_driver_is_harmless() {
        let scheduler = SyncScheduler::new();
        assert!(!scheduler.is_running());
        scheduler.stop();
        scheduler.stop();
    }
}
