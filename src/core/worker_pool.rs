//! Worker pools (spec.md §4.3): fixed-size and dynamic (min/max, live
//! rescale). Each worker executes tasks pulled from a `TaskSource` closure
//! supplied by the owning lane, so the pool itself doesn't care whether
//! the backing queue is a channel or a priority heap.
//!
//! Panic isolation is achieved by running each task's action inside its own
//! `tokio::spawn`: a panic inside user code surfaces as a `JoinError` on
//! the handle rather than unwinding the worker loop, so one bad task never
//! takes its worker down (spec.md §9 "panic/recover for worker
//! resilience").

use crate::core::task::Task;
use crate::errors::{EngineError, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Called by a worker to get its next task, or `None` to signal shutdown.
pub type TaskSource = Arc<dyn Fn() -> BoxFuture<'static, Option<Task>> + Send + Sync>;

/// Called after each task finishes with the wait time (enqueue to start)
/// and the process time (start to finish), so the lane can update its
/// rolling averages and counters.
pub type ResultSink = Arc<dyn Fn(&str, Result<()>, Duration, Duration) + Send + Sync>;

async fn run_task(source: &TaskSource, sink: &ResultSink) -> bool {
    let task = match source().await {
        Some(t) => t,
        None => return false,
    };
    let wait_time = Instant::now().saturating_duration_since(task.enqueued_at);
    let id = task.id.clone();
    let action = task.action;
    let started = Instant::now();
    let joined: std::result::Result<Result<()>, tokio::task::JoinError> =
        tokio::spawn(async move { (action)().await }).await;
    let process_time = Instant::now().saturating_duration_since(started);
    let outcome = match joined {
        Ok(result) => result,
        Err(join_err) => {
            if join_err.is_panic() {
                tracing::warn!(task_id = %id, "task panicked; worker recovered");
            }
            Err(EngineError::UserActionError(format!(
                "task {} aborted: {}",
                id, join_err
            )))
        }
    };
    sink(&id, outcome, wait_time, process_time);
    true
}

/// N workers pulling from a shared `TaskSource` until it yields `None`.
pub struct FixedWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl FixedWorkerPool {
    pub fn spawn(size: usize, source: TaskSource, sink: ResultSink) -> Self {
        let mut handles = Vec::with_capacity(size);
        for _ in 0..size {
            let source = source.clone();
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if !run_task(&source, &sink).await {
                        break;
                    }
                }
            }));
        }
        Self { handles }
    }

    /// Waits for all workers to drain (the source must already be
    /// signaling shutdown, typically via a closed channel).
    pub async fn join(self) {
        for h in self.handles {
            let _ = h.await;
        }
    }
}

/// Worker pool that can grow/shrink between `min_workers` and
/// `max_workers` while running. Scale-down is graceful: a worker finishes
/// its current task, notices its index is beyond the new target, and
/// exits; scale-up spawns fresh worker loops up to `max_workers`. See
/// SPEC_FULL.md's Open Question resolution for why this policy (not the
/// source's dangling scale-down channel) was chosen.
pub struct DynamicWorkerPool {
    source: TaskSource,
    sink: ResultSink,
    min_workers: usize,
    max_workers: usize,
    target: Arc<AtomicUsize>,
    next_index: Arc<AtomicUsize>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DynamicWorkerPool {
    pub fn new(min_workers: usize, max_workers: usize, source: TaskSource, sink: ResultSink) -> Arc<Self> {
        let pool = Arc::new(Self {
            source,
            sink,
            min_workers,
            max_workers,
            target: Arc::new(AtomicUsize::new(min_workers)),
            next_index: Arc::new(AtomicUsize::new(0)),
            handles: std::sync::Mutex::new(Vec::new()),
        });
        for _ in 0..min_workers {
            pool.spawn_one();
        }
        pool
    }

    fn spawn_one(self: &Arc<Self>) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if pool.target.load(Ordering::SeqCst) <= index {
                    break;
                }
                if !run_task(&pool.source, &pool.sink).await {
                    break;
                }
                if pool.target.load(Ordering::SeqCst) <= index {
                    break;
                }
            }
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// Raises the live worker target, spawning new workers as needed, up
    /// to `max_workers`.
    pub fn scale_up(self: &Arc<Self>, by: usize) {
        let current = self.target.load(Ordering::SeqCst);
        let new_target = (current + by).min(self.max_workers);
        let to_spawn = new_target.saturating_sub(current);
        self.target.store(new_target, Ordering::SeqCst);
        for _ in 0..to_spawn {
            self.spawn_one();
        }
    }

    /// Lowers the live worker target, not below `min_workers`. Workers
    /// whose index falls outside the new target exit after their current
    /// task.
    pub fn scale_down(&self, by: usize) {
        let current = self.target.load(Ordering::SeqCst);
        let new_target = current.saturating_sub(by).max(self.min_workers);
        self.target.store(new_target, Ordering::SeqCst);
    }

    pub fn current_target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// Waits for every worker to drain (the source must already be
    /// signaling shutdown, typically via a closed channel).
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for h in handles {
            let _ = h.await;
        }
    }
}
