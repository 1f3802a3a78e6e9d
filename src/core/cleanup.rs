//! Cleanup manager (spec.md §4.10): periodically trims WAL entries and
//! checkpoints for sagas that are both terminal and past their retention
//! horizon.

use crate::core::checkpoint::CheckpointStore;
use crate::core::saga::SagaState;
use crate::core::saga_store::SagaStore;
use crate::core::wal::Wal;
use crate::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct CleanupManager {
    wal: Arc<Wal>,
    checkpoints: Arc<CheckpointStore>,
    saga_store: Arc<SagaStore>,
    interval: Duration,
    retention: Duration,
    running: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(
        wal: Arc<Wal>,
        checkpoints: Arc<CheckpointStore>,
        saga_store: Arc<SagaStore>,
        interval: Duration,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            wal,
            checkpoints,
            saga_store,
            interval,
            retention,
            running: Arc::new(AtomicBool::new(false)),
            handle: std::sync::Mutex::new(None),
        })
    }

    /// Starts the periodic scan. Fails if already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::FailedPrecondition("cleanup manager already running".to_string()));
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.interval);
            loop {
                ticker.tick().await;
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = manager.sweep() {
                    tracing::warn!(error = %e, "cleanup sweep failed");
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// One pass over all saga instances: deletes the WAL and (if the
    /// checkpoint's recorded state is also terminal) the checkpoint for
    /// every instance that's terminal and older than the retention
    /// horizon.
    pub fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        let instances = self.saga_store.list(&Default::default())?;
        for instance in instances {
            if !instance.state.is_terminal() {
                continue;
            }
            if !Self::older_than(instance.updated_at, now, self.retention) {
                continue;
            }
            self.wal.delete_by_saga_id(&instance.id)?;
            if let Ok(checkpoint) = self.checkpoints.load(&instance.id) {
                if checkpoint.instance.state.is_terminal() {
                    self.checkpoints.delete(&instance.id)?;
                }
            }
            removed += 1;
        }
        Ok(removed)
    }

    fn older_than(timestamp: DateTime<Utc>, now: DateTime<Utc>, retention: Duration) -> bool {
        match chrono::Duration::from_std(retention) {
            Ok(retention) => now.signed_duration_since(timestamp) > retention,
            Err(_) => false,
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.stop();
    }
}
