//! Compensation executor (spec.md §4.6): runs a saga's steps in
//! reverse-topological order, retrying each compensation with backoff and
//! skipping steps already marked done in the idempotency store.

use crate::core::events::{EventType, SubscriberRegistry};
use crate::core::saga::{SagaDefinition, SagaInstance, StepContext};
use crate::core::wal::{Wal, WalEntry, WalEntryType};
use crate::errors::{EngineError, Result};
use crate::storage::KvStore;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn idempotency_key(saga_id: &str, step_id: &str) -> String {
    format!("idempotency:{saga_id}:{step_id}")
}

/// Tracks which `(saga_id, step_id)` compensations have already completed,
/// so a retried compensation run doesn't re-invoke a user action that
/// already succeeded.
pub struct IdempotencyStore {
    kv: Arc<KvStore>,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub fn has_seen(&self, saga_id: &str, step_id: &str) -> Result<bool> {
        Ok(self.kv.get(&idempotency_key(saga_id, step_id))?.is_some())
    }

    pub fn mark_seen(&self, saga_id: &str, step_id: &str) -> Result<()> {
        self.kv.put(&idempotency_key(saga_id, step_id), b"1")
    }
}

pub struct CompensationExecutor {
    wal: Arc<Wal>,
    idempotency: Arc<IdempotencyStore>,
    events: std::sync::Mutex<Option<Arc<SubscriberRegistry>>>,
}

impl CompensationExecutor {
    pub fn new(wal: Arc<Wal>, idempotency: Arc<IdempotencyStore>) -> Self {
        Self { wal, idempotency, events: std::sync::Mutex::new(None) }
    }

    /// Wires an event feed so compensation transitions are published
    /// after their WAL write commits; optional, mirrors the orchestrator.
    pub fn set_event_registry(&self, registry: Arc<SubscriberRegistry>) {
        *self.events.lock().unwrap() = Some(registry);
    }

    /// Runs compensation for `definition`/`instance`, triggered by `cause`.
    /// Layers run in reverse order; steps within a reversed layer run
    /// concurrently; the first per-layer failure stops further layers
    /// from starting, after the current layer drains.
    pub async fn run(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        cause: &str,
    ) -> Result<()> {
        let mut layers = definition.layers();
        layers.reverse();

        for layer in layers {
            let prior_results = instance.snapshot_prior_results();
            let mut handles = Vec::new();
            for step_id in &layer {
                if !instance.completed_steps.iter().any(|s| s == step_id) {
                    continue;
                }
                let Some(step) = definition.step(step_id) else {
                    continue;
                };
                let Some(compensation) = step.compensation.clone() else {
                    continue;
                };
                let saga_id = instance.id.clone();
                let step_id = step.id.clone();
                let retry = step.retry;
                let timeout = step.timeout.unwrap_or(definition.default_step_timeout);
                let ctx = StepContext {
                    saga_id: saga_id.clone(),
                    input: instance.input.clone(),
                    prior_results: prior_results.clone(),
                    cause: Some(cause.to_string()),
                };
                let wal = self.wal.clone();
                let idempotency = self.idempotency.clone();
                let registry = self.events.lock().unwrap().clone();
                handles.push(async move {
                    Self::compensate_step(
                        &wal,
                        &idempotency,
                        &saga_id,
                        &step_id,
                        compensation,
                        ctx,
                        retry,
                        timeout,
                        registry,
                    )
                    .await
                    .map(|_| step_id)
                });
            }
            let results = join_all(handles).await;
            let mut first_err = None;
            for result in results {
                match result {
                    Ok(step_id) => instance.mark_step_compensated(&step_id),
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn compensate_step(
        wal: &Wal,
        idempotency: &IdempotencyStore,
        saga_id: &str,
        step_id: &str,
        compensation: crate::core::saga::StepAction,
        ctx: StepContext,
        retry: crate::core::saga::RetryConfig,
        timeout: Duration,
        registry: Option<Arc<SubscriberRegistry>>,
    ) -> Result<()> {
        if idempotency.has_seen(saga_id, step_id)? {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 0..=retry.max_retries {
            wal.append(WalEntry::new(saga_id, WalEntryType::CompensationStarted, step_id))
                .await?;
            if let Some(r) = &registry {
                r.publish(saga_id, EventType::CompensationStarted, Some(step_id.to_string()), None)
                    .await;
            }

            let action = compensation.clone();
            let ctx = ctx.clone();
            let outcome = tokio::time::timeout(timeout, (action)(ctx)).await;

            match outcome {
                Ok(Ok(_)) => {
                    idempotency.mark_seen(saga_id, step_id)?;
                    wal.append(WalEntry::new(saga_id, WalEntryType::CompensationCompleted, step_id))
                        .await?;
                    if let Some(r) = &registry {
                        r.publish(saga_id, EventType::CompensationCompleted, Some(step_id.to_string()), None)
                            .await;
                    }
                    return Ok(());
                }
                Ok(Err(e)) => {
                    wal.append(
                        WalEntry::new(saga_id, WalEntryType::CompensationFailed, step_id)
                            .with_message(e.to_string()),
                    )
                    .await?;
                    if let Some(r) = &registry {
                        r.publish(saga_id, EventType::CompensationFailed, Some(step_id.to_string()), Some(e.to_string()))
                            .await;
                    }
                    last_err = Some(e);
                }
                Err(_) => {
                    let e = EngineError::Canceled(format!("compensation for {step_id} timed out"));
                    wal.append(
                        WalEntry::new(saga_id, WalEntryType::CompensationFailed, step_id)
                            .with_message(e.to_string()),
                    )
                    .await?;
                    if let Some(r) = &registry {
                        r.publish(saga_id, EventType::CompensationFailed, Some(step_id.to_string()), Some(e.to_string()))
                            .await;
                    }
                    last_err = Some(e);
                }
            }

            if attempt < retry.max_retries {
                let backoff = Duration::from_secs_f64(
                    (retry.initial_backoff.as_secs_f64() * retry.backoff_factor.powi(attempt as i32))
                        .min(retry.max_backoff.as_secs_f64()),
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(EngineError::UserActionError(format!(
            "compensation for step {step_id} failed after {} attempts: {}",
            retry.max_retries + 1,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::saga::{CompensationPolicy, SagaBuilder, SagaState, Step};
    use crate::core::wal::WalWriteMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_action() -> crate::core::saga::StepAction {
        Arc::new(|_ctx| Box::pin(async { Ok(serde_json::json!({})) }))
    }

    #[tokio::test]
    async fn compensates_completed_steps_in_reverse_order() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let wal = Wal::new(kv.clone(), WalWriteMode::Sync, 16);
        let idempotency = Arc::new(IdempotencyStore::new(kv));
        let executor = CompensationExecutor::new(wal, idempotency);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        let definition = SagaBuilder::new("d1", "test")
            .compensation_policy(CompensationPolicy::Auto)
            .step(
                Step::new("a", noop_action()).with_compensation(Arc::new(move |_ctx| {
                    let order = order_a.clone();
                    Box::pin(async move {
                        order.lock().unwrap().push("a");
                        Ok(serde_json::json!({}))
                    })
                })),
            )
            .step(
                Step::new("b", noop_action())
                    .depends_on(["a"])
                    .with_compensation(Arc::new(move |_ctx| {
                        let order = order_b.clone();
                        Box::pin(async move {
                            order.lock().unwrap().push("b");
                            Ok(serde_json::json!({}))
                        })
                    })),
            )
            .build()
            .unwrap();

        let mut instance = SagaInstance::new("s1", "d1", serde_json::json!({}));
        instance.mark_step_completed("a", serde_json::json!({}));
        instance.mark_step_completed("b", serde_json::json!({}));
        instance.state = SagaState::Compensating;

        executor.run(&definition, &mut instance, "step b failed").await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
        assert_eq!(instance.compensated_steps, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn retries_then_fails_after_max_retries() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let wal = Wal::new(kv.clone(), WalWriteMode::Sync, 16);
        let idempotency = Arc::new(IdempotencyStore::new(kv));
        let executor = CompensationExecutor::new(wal, idempotency);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let definition = SagaBuilder::new("d1", "test")
            .step(
                Step::new("a", noop_action()).with_compensation(Arc::new(move |_ctx| {
                    let calls = calls_clone.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(EngineError::UserActionError("always fails".to_string()))
                    })
                }))
                .with_retry(crate::core::saga::RetryConfig {
                    max_retries: 2,
                    initial_backoff: Duration::from_millis(1),
                    backoff_factor: 1.0,
                    max_backoff: Duration::from_millis(5),
                }),
            )
            .build()
            .unwrap();

        let mut instance = SagaInstance::new("s1", "d1", serde_json::json!({}));
        instance.mark_step_completed("a", serde_json::json!({}));

        let result = executor.run(&definition, &mut instance, "cause").await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn already_seen_compensation_is_skipped() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let wal = Wal::new(kv.clone(), WalWriteMode::Sync, 16);
        let idempotency = Arc::new(IdempotencyStore::new(kv));
        idempotency.mark_seen("s1", "a").unwrap();
        let executor = CompensationExecutor::new(wal, idempotency);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let definition = SagaBuilder::new("d1", "test")
            .step(Step::new("a", noop_action()).with_compensation(Arc::new(move |_ctx| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({}))
                })
            })))
            .build()
            .unwrap();

        let mut instance = SagaInstance::new("s1", "d1", serde_json::json!({}));
        instance.mark_step_completed("a", serde_json::json!({}));
        executor.run(&definition, &mut instance, "cause").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
