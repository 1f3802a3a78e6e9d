//! Fallback lane (spec.md §4.4.3): wraps a primary (distributed) lane and
//! a secondary (local) lane, degrading to the secondary on primary
//! connectivity failure and recovering once a background health check
//! succeeds again.

use crate::cancel::CancelToken;
use crate::core::lane::{LaneHandle, LaneStatsSnapshot};
use crate::core::task::Task;
use crate::errors::{EngineError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FallbackCounters {
    degrades: AtomicU64,
    recovers: AtomicU64,
}

pub struct FallbackLane {
    name: String,
    primary: Arc<dyn LaneHandle>,
    secondary: Arc<dyn LaneHandle>,
    degraded: Arc<AtomicBool>,
    counters: Arc<FallbackCounters>,
    health_checker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FallbackLane {
    /// `health_check` is polled on `interval` while degraded; a `true`
    /// result flips the lane back to the primary.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        primary: Arc<dyn LaneHandle>,
        secondary: Arc<dyn LaneHandle>,
        interval: Duration,
        health_check: F,
    ) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let lane = Arc::new(Self {
            name: name.into(),
            primary,
            secondary,
            degraded: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(FallbackCounters::default()),
            health_checker: std::sync::Mutex::new(None),
        });

        let degraded = lane.degraded.clone();
        let counters = lane.counters.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if degraded.load(Ordering::SeqCst) && health_check().await {
                    degraded.store(false, Ordering::SeqCst);
                    counters.recovers.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        *lane.health_checker.lock().unwrap() = Some(handle);
        lane
    }

    fn degrade(&self, reason: &EngineError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.counters.degrades.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(lane = %self.name, error = %reason, "fallback lane degraded to secondary");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn degrade_count(&self) -> u64 {
        self.counters.degrades.load(Ordering::Relaxed)
    }

    pub fn recover_count(&self) -> u64 {
        self.counters.recovers.load(Ordering::Relaxed)
    }
}

impl Drop for FallbackLane {
    fn drop(&mut self) {
        if let Some(handle) = self.health_checker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl LaneHandle for FallbackLane {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, task: Task, cancel: &CancelToken) -> Result<()> {
        if self.degraded.load(Ordering::SeqCst) {
            return self.secondary.submit(task, cancel).await;
        }
        match self.primary.submit(task, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connectivity() => {
                // The task was already consumed by the failed primary
                // attempt, so this call itself returns the error; the
                // degrade flip means every subsequent submit routes
                // straight to the secondary without retrying primary.
                self.degrade(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn try_submit(&self, task: Task) -> Result<()> {
        if self.degraded.load(Ordering::SeqCst) {
            return self.secondary.try_submit(task);
        }
        match self.primary.try_submit(task) {
            Ok(()) => Ok(()),
            Err(e) if e.is_connectivity() => {
                self.degrade(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self, cancel: &CancelToken) -> Result<()> {
        let a = self.primary.close(cancel).await;
        let b = self.secondary.close(cancel).await;
        a.and(b)
    }

    fn stats(&self) -> LaneStatsSnapshot {
        self.primary.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lane::{ChannelLane, LaneConfig};
    use std::sync::atomic::AtomicUsize;

    struct FlakyLane {
        name: String,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl LaneHandle for FlakyLane {
        fn name(&self) -> &str {
            &self.name
        }
        async fn submit(&self, _task: Task, _cancel: &CancelToken) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(EngineError::Unavailable("simulated outage".to_string()))
            } else {
                Ok(())
            }
        }
        fn try_submit(&self, _task: Task) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(EngineError::Unavailable("simulated outage".to_string()))
            } else {
                Ok(())
            }
        }
        async fn close(&self, _cancel: &CancelToken) -> Result<()> {
            Ok(())
        }
        fn stats(&self) -> LaneStatsSnapshot {
            LaneStatsSnapshot {
                name: self.name.clone(),
                accepted: 0,
                rejected: 0,
                redirected: 0,
                dropped: 0,
                completed: 0,
                failed: 0,
                pending: 0,
                running: 0,
                capacity: 0,
                max_concurrency: 0,
                avg_wait: Duration::ZERO,
                avg_process: Duration::ZERO,
            }
        }
    }

    fn noop_task(id: &str, counter: Arc<AtomicUsize>) -> Task {
        Task::new(
            id,
            "lane",
            0,
            Box::new(move || {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
    }

    #[tokio::test]
    async fn degrades_to_secondary_on_connectivity_error_and_recovers() {
        let primary = Arc::new(FlakyLane {
            name: "primary".to_string(),
            fail: AtomicBool::new(true),
        });
        let secondary = ChannelLane::new(LaneConfig::new("secondary", 4, 1));
        let lane = FallbackLane::new(
            "combined",
            primary.clone(),
            secondary.clone(),
            Duration::from_millis(10),
            {
                let primary = primary.clone();
                move || {
                    let primary = primary.clone();
                    async move { !primary.fail.load(Ordering::SeqCst) }
                }
            },
        );

        let cancel = CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = lane.submit(noop_task("t1", counter.clone()), &cancel).await;
        assert!(result.is_err());
        assert!(lane.is_degraded());

        lane.submit(noop_task("t2", counter.clone()), &cancel).await.unwrap();

        primary.fail.store(false, Ordering::SeqCst);
        for _ in 0..50 {
            if !lane.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!lane.is_degraded());
        assert_eq!(lane.recover_count(), 1);
    }
}
