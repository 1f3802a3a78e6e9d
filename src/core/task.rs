//! The unit of work submitted to a lane (spec.md §3 "Task").

use std::future::Future;
use std::pin::Pin;
use tokio::time::Instant;

use crate::errors::Result;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type TaskAction = Box<dyn FnOnce() -> TaskFuture + Send>;

/// A task submitted to a lane. `seq` is assigned by the lane on admission
/// and is what breaks priority ties deterministically (spec.md §4.2).
pub struct Task {
    pub id: String,
    pub priority: i64,
    pub lane: String,
    pub seq: u64,
    pub action: TaskAction,
    /// Distributed-mode extras (spec.md §3).
    pub shard_key: Option<String>,
    pub fencing_token: Option<u64>,
    pub enqueued_at: Instant,
}

impl Task {
    pub fn new(id: impl Into<String>, lane: impl Into<String>, priority: i64, action: TaskAction) -> Self {
        Self {
            id: id.into(),
            priority,
            lane: lane.into(),
            seq: 0,
            action,
            shard_key: None,
            fencing_token: None,
            enqueued_at: Instant::now(),
        }
    }

    pub fn with_shard(mut self, shard_key: impl Into<String>, fencing_token: u64) -> Self {
        self.shard_key = Some(shard_key.into());
        self.fencing_token = Some(fencing_token);
        self
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("lane", &self.lane)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Ordering key used by the priority queue: priority DESC, then insertion
/// sequence ASC. Kept separate from `Task` so the queue doesn't need to
/// move the (non-`Clone`) action around to compare entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub priority: i64,
    pub seq: u64,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
