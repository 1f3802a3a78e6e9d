//! Redis-backed lane (spec.md §4.4.2): same contract as `ChannelLane`, but
//! the backing queue is a Redis list (FIFO) or sorted set (priority) so
//! several process instances can share one lane.
//!
//! Task closures can't cross a Redis connection, so only a lightweight,
//! serializable envelope (id, priority, shard key, fencing token) is
//! pushed; the action itself is kept in a local dispatch table keyed by
//! task id. This mirrors job-queue systems that serialize arguments and
//! resolve the handler locally rather than shipping code.

use crate::cancel::CancelToken;
use crate::core::lane::{BackpressureStrategy, LaneConfig, LaneHandle, LaneStats, LaneStatsSnapshot};
use crate::core::ownership::OwnershipCoordinator;
use crate::core::lane_manager::LaneManager;
use crate::core::task::{Task, TaskAction};
use crate::errors::{EngineError, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RedisLaneOptions {
    pub key_prefix: String,
    pub block_timeout: Duration,
    pub dedup: bool,
    pub dedup_ttl: Duration,
}

impl Default for RedisLaneOptions {
    fn default() -> Self {
        Self {
            key_prefix: "laneforge".to_string(),
            block_timeout: Duration::from_secs(1),
            dedup: false,
            dedup_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEnvelope {
    id: String,
    priority: i64,
    shard_key: Option<String>,
    fencing_token: Option<u64>,
    enqueued_at_millis: u64,
}

pub struct RedisLane {
    config: LaneConfig,
    opts: RedisLaneOptions,
    client: redis::Client,
    ownership: Option<Arc<OwnershipCoordinator>>,
    actions: Mutex<HashMap<String, TaskAction>>,
    pending: AtomicI64,
    closed: Arc<AtomicBool>,
    stats: Arc<LaneStats>,
    seq: AtomicU64,
    manager: Mutex<Option<Weak<LaneManager>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    self_weak: Mutex<Option<Weak<RedisLane>>>,
}

impl RedisLane {
    pub fn new(
        config: LaneConfig,
        client: redis::Client,
        opts: RedisLaneOptions,
        ownership: Option<Arc<OwnershipCoordinator>>,
    ) -> Arc<Self> {
        let lane = Arc::new(Self {
            config,
            opts,
            client,
            ownership,
            actions: Mutex::new(HashMap::new()),
            pending: AtomicI64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(LaneStats::default()),
            seq: AtomicU64::new(0),
            manager: Mutex::new(None),
            worker: Mutex::new(None),
            self_weak: Mutex::new(None),
        });
        *lane.self_weak.lock().unwrap() = Some(Arc::downgrade(&lane));
        lane.spawn_worker();
        lane
    }

    pub fn set_manager(&self, manager: Weak<LaneManager>) {
        *self.manager.lock().unwrap() = Some(manager);
    }

    fn list_key(&self) -> String {
        format!("{}:lane:{}:list", self.opts.key_prefix, self.config.name)
    }

    fn zset_key(&self) -> String {
        format!("{}:lane:{}:zset", self.opts.key_prefix, self.config.name)
    }

    fn dedup_key(&self, id: &str) -> String {
        format!("{}:lane:{}:dedup:{}", self.opts.key_prefix, self.config.name, id)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Unavailable(format!("redis connect: {e}")))
    }

    async fn depth(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<i64> {
        if self.config.priority_enabled {
            conn.zcard(self.zset_key())
                .await
                .map_err(|e| EngineError::Unavailable(format!("redis zcard: {e}")))
        } else {
            conn.llen(self.list_key())
                .await
                .map_err(|e| EngineError::Unavailable(format!("redis llen: {e}")))
        }
    }

    async fn push_envelope(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task: &Task,
    ) -> Result<()> {
        let envelope = TaskEnvelope {
            id: task.id.clone(),
            priority: task.priority,
            shard_key: task.shard_key.clone(),
            fencing_token: task.fencing_token,
            enqueued_at_millis: 0,
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| EngineError::Internal(format!("envelope encode: {e}")))?;
        if self.config.priority_enabled {
            conn.zadd(self.zset_key(), payload, envelope.priority)
                .await
                .map_err(|e| EngineError::Unavailable(format!("redis zadd: {e}")))
        } else {
            conn.lpush(self.list_key(), payload)
                .await
                .map_err(|e| EngineError::Unavailable(format!("redis lpush: {e}")))
        }
    }

    /// Checks dedup (if enabled), pushes the envelope, stores the action
    /// locally, and bumps counters. Rolls the dedup entry back if the
    /// envelope push fails (compensating rollback per spec.md §4.4.2).
    async fn enqueue(&self, mut task: Task) -> Result<()> {
        task.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut conn = self.conn().await?;
        if self.opts.dedup {
            let added: i64 = conn
                .sadd(self.dedup_key(&task.id), 1)
                .await
                .map_err(|e| EngineError::Unavailable(format!("redis sadd: {e}")))?;
            if added == 0 {
                return Err(EngineError::TaskDuplicate);
            }
            let _: Result<()> = conn
                .expire(self.dedup_key(&task.id), self.opts.dedup_ttl.as_secs() as i64)
                .await
                .map_err(|e: redis::RedisError| EngineError::Unavailable(format!("redis expire: {e}")));
        }
        let id = task.id.clone();
        let action = {
            let mut actions = self.actions.lock().unwrap();
            actions.insert(id.clone(), task.action);
            id.clone()
        };
        if let Err(e) = self.push_envelope(&mut conn, &task).await {
            self.actions.lock().unwrap().remove(&action);
            if self.opts.dedup {
                let _: Result<()> = conn
                    .del(self.dedup_key(&id))
                    .await
                    .map_err(|e: redis::RedisError| EngineError::Unavailable(format!("redis del: {e}")));
            }
            return Err(e);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn redirect_target(&self, target: &str) -> Option<Arc<dyn LaneHandle>> {
        self.manager
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|w| w.upgrade())
            .and_then(|m| m.get(target))
    }

    fn spawn_worker(self: &Arc<Self>) {
        let lane = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if lane.closed.load(Ordering::SeqCst) && lane.pending.load(Ordering::SeqCst) <= 0 {
                    break;
                }
                match lane.dequeue_one().await {
                    Ok(Some(())) => {}
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, lane = %lane.config.name, "redis lane dequeue error");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    async fn dequeue_one(self: &Arc<Self>) -> Result<Option<()>> {
        let mut conn = self.conn().await?;
        let envelope: Option<TaskEnvelope> = if self.config.priority_enabled {
            let popped: Option<(String, f64)> = conn
                .zpopmax(self.zset_key(), 1)
                .await
                .map_err(|e| EngineError::Unavailable(format!("redis zpopmax: {e}")))?;
            match popped {
                Some((payload, _)) => Some(
                    serde_json::from_str(&payload)
                        .map_err(|e| EngineError::Internal(format!("envelope decode: {e}")))?,
                ),
                None => None,
            }
        } else {
            let popped: Option<String> = conn
                .brpop(self.list_key(), self.opts.block_timeout.as_secs_f64())
                .await
                .map(|mut v: Vec<String>| if v.len() >= 2 { Some(v.remove(1)) } else { None })
                .unwrap_or(None);
            match popped {
                Some(payload) => Some(
                    serde_json::from_str(&payload)
                        .map_err(|e| EngineError::Internal(format!("envelope decode: {e}")))?,
                ),
                None => None,
            }
        };
        let envelope = match envelope {
            Some(e) => e,
            None => return Ok(None),
        };

        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.stats.pending.fetch_sub(1, Ordering::SeqCst);
        self.stats.running.fetch_add(1, Ordering::SeqCst);

        if let Some(coord) = &self.ownership {
            if !coord.can_consume(&self.config.name) {
                self.stats.running.fetch_sub(1, Ordering::SeqCst);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(()));
            }
            if let Some(token) = envelope.fencing_token {
                if let Some(shard) = &envelope.shard_key {
                    if coord.validate_fencing_token(shard, token).is_err() {
                        self.stats.running.fetch_sub(1, Ordering::SeqCst);
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(()));
                    }
                }
            }
        }

        let action = self.actions.lock().unwrap().remove(&envelope.id);
        let started = Instant::now();
        let result = match action {
            Some(action) => {
                let joined: std::result::Result<Result<()>, tokio::task::JoinError> =
                    tokio::spawn(async move { (action)().await }).await;
                match joined {
                    Ok(r) => r,
                    Err(e) => Err(EngineError::UserActionError(format!("task aborted: {e}"))),
                }
            }
            None => Err(EngineError::Internal(format!(
                "no local action for task {}",
                envelope.id
            ))),
        };
        self.stats.process_time.record(started.elapsed());
        self.stats.running.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if self.opts.dedup {
            let mut conn = self.conn().await?;
            let _: Result<()> = conn
                .del(self.dedup_key(&envelope.id))
                .await
                .map_err(|e: redis::RedisError| EngineError::Unavailable(format!("redis del: {e}")));
        }
        Ok(Some(()))
    }
}

#[async_trait::async_trait]
impl LaneHandle for RedisLane {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn submit(&self, task: Task, cancel: &CancelToken) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::LaneClosed);
        }
        let mut conn = self.conn().await?;
        let current = self.depth(&mut conn).await.unwrap_or(self.pending.load(Ordering::SeqCst));
        let at_capacity = (self.pending.load(Ordering::SeqCst).max(current) as usize) >= self.config.capacity;

        if !at_capacity {
            return self.enqueue(task).await;
        }

        match self.config.backpressure.clone() {
            BackpressureStrategy::Block => {
                loop {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Canceled("submit canceled".to_string()));
                    }
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(EngineError::LaneClosed);
                    }
                    let mut conn = self.conn().await?;
                    let depth = self.depth(&mut conn).await?;
                    if (depth as usize) < self.config.capacity {
                        return self.enqueue(task).await;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
            BackpressureStrategy::Drop => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::TaskDropped)
            }
            BackpressureStrategy::Redirect(target) => match self.redirect_target(&target) {
                Some(lane) => match lane.submit(task, cancel).await {
                    Ok(()) => {
                        self.stats.redirected.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(_) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        Err(EngineError::LaneFull)
                    }
                },
                None => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(EngineError::LaneFull)
                }
            },
        }
    }

    /// Non-blocking per the fast-path contract: rejects immediately
    /// against the local pending counter without a Redis round trip, then
    /// hands the actual push off to a background task so this method
    /// never awaits. Narrower contract than the in-memory lane's
    /// `try_submit`: a background push failure can't be returned to this
    /// call's already-returned `Ok(())`, so it only shows up as a bumped
    /// `dropped` stat and a warning log, not as an error the caller sees.
    fn try_submit(&self, task: Task) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::LaneClosed);
        }
        if self.pending.load(Ordering::SeqCst) as usize >= self.config.capacity {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::TaskDropped);
        }
        let weak = self.self_weak.lock().unwrap().clone();
        match weak.and_then(|w| w.upgrade()) {
            Some(lane) => {
                tokio::spawn(async move {
                    if let Err(e) = lane.enqueue(task).await {
                        tracing::warn!(error = %e, "background redis enqueue failed");
                        lane.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                });
                Ok(())
            }
            None => Err(EngineError::Internal("lane torn down".to_string())),
        }
    }

    async fn close(&self, cancel: &CancelToken) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            tokio::select! {
                _ = handle => {}
                _ = cancel.cancelled() => {}
            }
        }
        Ok(())
    }

    fn stats(&self) -> LaneStatsSnapshot {
        self.stats
            .snapshot(&self.config.name, self.config.capacity, self.config.max_concurrency)
    }
}
