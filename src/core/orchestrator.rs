//! Saga orchestrator (spec.md §4.5): the forward DAG executor. Runs a
//! saga's steps layer by layer, durably logging each transition to the
//! WAL and checkpoint store, and branches into compensation on failure.

use crate::cancel::CancelToken;
use crate::core::checkpoint::{Checkpoint, Checkpointer};
use crate::core::compensation::CompensationExecutor;
use crate::core::events::{EventType, SubscriberRegistry};
use crate::core::saga::{
    CompensationPolicy, SagaDefinition, SagaInstance, SagaState, StepContext,
};
use crate::core::saga_store::SagaStore;
use crate::core::wal::{Wal, WalEntry, WalEntryType};
use crate::errors::{EngineError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;

const SAGA_TIMEOUT_STEP_ID: &str = "saga-timeout";
const SAGA_CANCEL_STEP_ID: &str = "saga-cancel";

/// Tracks the run token and soft-cancel flag for one in-flight `execute`
/// call, so an external caller can reach in via instance id.
struct RunControl {
    run_token: CancelToken,
    soft_cancelled: AtomicBool,
}

/// Removes a saga's `RunControl` entry once its `run()` call returns,
/// regardless of which exit path was taken.
struct ControlGuard<'a> {
    orchestrator: &'a SagaOrchestrator,
    instance_id: String,
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.controls.write().unwrap().remove(&self.instance_id);
    }
}

pub struct SagaOrchestrator {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    instances: RwLock<HashMap<String, SagaInstance>>,
    controls: RwLock<HashMap<String, Arc<RunControl>>>,
    events: std::sync::Mutex<Option<Arc<SubscriberRegistry>>>,
    wal: Arc<Wal>,
    checkpointer: Option<Arc<Checkpointer>>,
    saga_store: Option<Arc<SagaStore>>,
    compensation: Arc<CompensationExecutor>,
    concurrency: Arc<Semaphore>,
}

impl SagaOrchestrator {
    pub fn new(
        wal: Arc<Wal>,
        checkpointer: Option<Arc<Checkpointer>>,
        saga_store: Option<Arc<SagaStore>>,
        compensation: Arc<CompensationExecutor>,
        max_concurrent_sagas: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            controls: RwLock::new(HashMap::new()),
            events: std::sync::Mutex::new(None),
            wal,
            checkpointer,
            saga_store,
            compensation,
            concurrency: Arc::new(Semaphore::new(max_concurrent_sagas)),
        })
    }

    pub fn register_definition(&self, definition: SagaDefinition) {
        self.definitions
            .write()
            .unwrap()
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn definition(&self, id: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.read().unwrap().get(id).cloned()
    }

    pub fn get(&self, instance_id: &str) -> Option<SagaInstance> {
        self.instances.read().unwrap().get(instance_id).cloned()
    }

    /// Cancels a running saga. `force=true` cancels the run token
    /// immediately, interrupting in-flight steps; `force=false` only
    /// requests that no further layers be scheduled after the current one
    /// finishes. No-op-returns-error if the instance isn't currently
    /// executing (already terminal, or unknown).
    pub fn cancel(&self, instance_id: &str, force: bool) -> Result<()> {
        let control = self
            .controls
            .read()
            .unwrap()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no running saga {instance_id}")))?;
        if force {
            control.run_token.cancel();
        } else {
            control.soft_cancelled.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Wires an event feed so step/saga transitions are published to it
    /// after their WAL write commits. Optional: a `SagaOrchestrator` with
    /// no registry set runs exactly as before, just without the feed.
    pub fn set_event_registry(&self, registry: Arc<SubscriberRegistry>) {
        *self.events.lock().unwrap() = Some(registry);
    }

    async fn publish(&self, subject: &str, event_type: EventType, sub_id: Option<String>, message: Option<String>) {
        let registry = self.events.lock().unwrap().clone();
        if let Some(registry) = registry {
            registry.publish(subject, event_type, sub_id, message).await;
        }
    }

    fn snapshot(&self, instance: &SagaInstance) {
        self.instances
            .write()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        if let Some(store) = &self.saga_store {
            let _ = store.save(instance);
        }
    }

    /// Executes `definition_id` as instance `instance_id` against `input`,
    /// driving it through forward execution and, on failure, the
    /// compensation branch dictated by the definition's policy.
    pub async fn execute(
        &self,
        instance_id: impl Into<String>,
        definition_id: &str,
        input: serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<SagaInstance> {
        let definition = self
            .definition(definition_id)
            .ok_or_else(|| EngineError::NotFound(format!("saga definition {definition_id}")))?;
        let mut instance = SagaInstance::new(instance_id, definition_id, input);
        self.run(&definition, &mut instance, cancel).await?;
        Ok(instance)
    }

    async fn run(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        cancel: &CancelToken,
    ) -> Result<()> {
        let permit = tokio::select! {
            permit = self.concurrency.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Internal("concurrency semaphore closed".to_string()))?
            }
            _ = cancel.cancelled() => return Err(EngineError::Canceled("saga execution canceled".to_string())),
        };

        let run_token = match definition.timeout {
            Some(timeout) => cancel.child_with_timeout(timeout),
            None => cancel.clone(),
        };

        let control = Arc::new(RunControl {
            run_token: run_token.clone(),
            soft_cancelled: AtomicBool::new(false),
        });
        self.controls.write().unwrap().insert(instance.id.clone(), control.clone());
        let _control_guard = ControlGuard { orchestrator: self, instance_id: instance.id.clone() };

        instance.transition_to(SagaState::Running)?;
        self.snapshot(instance);

        let layers = definition.layers();
        let mut first_failure: Option<(String, String)> = None;

        'layers: for layer in &layers {
            if run_token.is_cancelled() {
                let message = "saga timed out".to_string();
                self.wal
                    .append(WalEntry::new(&instance.id, WalEntryType::StepFailed, SAGA_TIMEOUT_STEP_ID)
                        .with_message(message.clone()))
                    .await?;
                first_failure = Some((SAGA_TIMEOUT_STEP_ID.to_string(), message));
                break 'layers;
            }
            if control.soft_cancelled.load(Ordering::SeqCst) {
                let message = "saga canceled".to_string();
                self.wal
                    .append(WalEntry::new(&instance.id, WalEntryType::StepFailed, SAGA_CANCEL_STEP_ID)
                        .with_message(message.clone()))
                    .await?;
                first_failure = Some((SAGA_CANCEL_STEP_ID.to_string(), message));
                break 'layers;
            }

            let prior_results = instance.snapshot_prior_results();
            let registry = self.events.lock().unwrap().clone();
            let mut futures = Vec::new();
            for step_id in layer {
                let Some(step) = definition.step(step_id) else { continue };
                let action = step.action.clone();
                let timeout = step.timeout.unwrap_or(definition.default_step_timeout);
                let ctx = StepContext {
                    saga_id: instance.id.clone(),
                    input: instance.input.clone(),
                    prior_results: prior_results.clone(),
                    cause: None,
                };
                let wal = self.wal.clone();
                let saga_id = instance.id.clone();
                let step_id = step.id.clone();
                let force_cancel = run_token.clone();
                let registry = registry.clone();
                futures.push(async move {
                    if let Err(e) = wal.append(WalEntry::new(&saga_id, WalEntryType::StepStarted, &step_id)).await {
                        return Err((step_id, e.to_string()));
                    }
                    if let Some(r) = &registry {
                        r.publish(&saga_id, EventType::StepStarted, Some(step_id.clone()), None).await;
                    }
                    let outcome = tokio::select! {
                        outcome = tokio::time::timeout(timeout, (action)(ctx)) => outcome,
                        _ = force_cancel.cancelled() => {
                            let message = "saga canceled".to_string();
                            let _ = wal.append(
                                WalEntry::new(&saga_id, WalEntryType::StepFailed, &step_id)
                                    .with_message(message.clone()),
                            )
                            .await;
                            if let Some(r) = &registry {
                                r.publish(&saga_id, EventType::StepFailed, Some(step_id.clone()), Some(message.clone())).await;
                            }
                            return Err((step_id, message));
                        }
                    };
                    match outcome {
                        Ok(Ok(value)) => {
                            if let Err(e) = wal.append(WalEntry::new(&saga_id, WalEntryType::StepCompleted, &step_id)).await {
                                return Err((step_id, e.to_string()));
                            }
                            if let Some(r) = &registry {
                                r.publish(&saga_id, EventType::StepCompleted, Some(step_id.clone()), None).await;
                            }
                            Ok((step_id, value))
                        }
                        Ok(Err(e)) => {
                            let _ = wal.append(
                                WalEntry::new(&saga_id, WalEntryType::StepFailed, &step_id)
                                    .with_message(e.to_string()),
                            )
                            .await;
                            if let Some(r) = &registry {
                                r.publish(&saga_id, EventType::StepFailed, Some(step_id.clone()), Some(e.to_string())).await;
                            }
                            Err((step_id, e.to_string()))
                        }
                        Err(_) => {
                            let message = "step timed out".to_string();
                            let _ = wal.append(
                                WalEntry::new(&saga_id, WalEntryType::StepFailed, &step_id)
                                    .with_message(message.clone()),
                            )
                            .await;
                            if let Some(r) = &registry {
                                r.publish(&saga_id, EventType::StepFailed, Some(step_id.clone()), Some(message.clone())).await;
                            }
                            Err((step_id, message))
                        }
                    }
                });
            }

            let results = join_all(futures).await;
            for result in results {
                match result {
                    Ok((step_id, value)) => {
                        match &self.checkpointer {
                            Some(checkpointer) => {
                                checkpointer.record_step_completion(instance, &step_id, value)?;
                            }
                            None => instance.mark_step_completed(&step_id, value),
                        }
                        self.snapshot(instance);
                    }
                    Err((step_id, reason)) => {
                        if first_failure.is_none() {
                            first_failure = Some((step_id, reason));
                        }
                    }
                }
            }
            if first_failure.is_some() {
                break 'layers;
            }
        }

        drop(permit);

        match first_failure {
            None => {
                instance.transition_to(SagaState::Completed)?;
                self.snapshot(instance);
                self.publish(&instance.id, EventType::SagaCompleted, None, None).await;
                Ok(())
            }
            Some((step_id, reason)) => {
                instance.record_failure(step_id, reason.clone());
                self.publish(&instance.id, EventType::SagaFailed, None, Some(reason.clone())).await;
                self.branch_on_failure(definition, instance, &reason).await
            }
        }
    }

    async fn branch_on_failure(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        cause: &str,
    ) -> Result<()> {
        match definition.compensation_policy {
            CompensationPolicy::Auto => {
                instance.transition_to(SagaState::Compensating)?;
                self.snapshot(instance);
                match self.compensation.run(definition, instance, cause).await {
                    Ok(()) => {
                        instance.transition_to(SagaState::Compensated)?;
                        self.snapshot(instance);
                        Err(EngineError::UserActionError(cause.to_string()))
                    }
                    Err(e) => {
                        instance.transition_to(SagaState::CompensationFailed)?;
                        self.snapshot(instance);
                        Err(e)
                    }
                }
            }
            CompensationPolicy::Manual => {
                instance.transition_to(SagaState::PendingCompensation)?;
                self.snapshot(instance);
                Err(EngineError::UserActionError(cause.to_string()))
            }
            CompensationPolicy::Skip => {
                instance.transition_to(SagaState::CompensationFailed)?;
                self.snapshot(instance);
                Err(EngineError::UserActionError(cause.to_string()))
            }
        }
    }

    /// Resumes an instance stuck in `PendingCompensation`, running
    /// compensation directly.
    pub async fn trigger_compensation(&self, instance_id: &str, reason: &str) -> Result<()> {
        let mut instance = self
            .get(instance_id)
            .ok_or_else(|| EngineError::NotFound(format!("saga instance {instance_id}")))?;
        let definition = self
            .definition(&instance.definition_id)
            .ok_or_else(|| EngineError::NotFound(format!("saga definition {}", instance.definition_id)))?;
        instance.transition_to(SagaState::Compensating)?;
        self.snapshot(&instance);
        match self.compensation.run(&definition, &mut instance, reason).await {
            Ok(()) => {
                instance.transition_to(SagaState::Compensated)?;
                self.snapshot(&instance);
                Ok(())
            }
            Err(e) => {
                instance.transition_to(SagaState::CompensationFailed)?;
                self.snapshot(&instance);
                Err(e)
            }
        }
    }

    /// Rebuilds execution from a checkpoint: re-runs only steps not yet
    /// completed if `Running`, re-enters compensation if `Compensating`,
    /// and is a no-op for terminal states.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint: Checkpoint,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut instance = checkpoint.instance;
        let definition = self
            .definition(&instance.definition_id)
            .ok_or_else(|| EngineError::NotFound(format!("saga definition {}", instance.definition_id)))?;

        match instance.state {
            SagaState::Running => {
                instance.transition_to(SagaState::Recovering)?;
                instance.transition_to(SagaState::Running)?;
                self.snapshot(&instance);
                self.resume_forward(&definition, &mut instance, cancel).await
            }
            SagaState::Compensating => {
                instance.transition_to(SagaState::Recovering)?;
                instance.transition_to(SagaState::Compensating)?;
                self.snapshot(&instance);
                let reason = instance
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "resumed after crash".to_string());
                match self.compensation.run(&definition, &mut instance, &reason).await {
                    Ok(()) => {
                        instance.transition_to(SagaState::Compensated)?;
                        self.snapshot(&instance);
                        Ok(())
                    }
                    Err(e) => {
                        instance.transition_to(SagaState::CompensationFailed)?;
                        self.snapshot(&instance);
                        Err(e)
                    }
                }
            }
            _ => {
                self.snapshot(&instance);
                Ok(())
            }
        }
    }

    async fn resume_forward(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        cancel: &CancelToken,
    ) -> Result<()> {
        let layers = definition.layers();
        let mut first_failure: Option<(String, String)> = None;

        for layer in &layers {
            let remaining: Vec<String> = layer
                .iter()
                .filter(|id| !instance.completed_steps.iter().any(|c| c == *id))
                .cloned()
                .collect();
            if remaining.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                first_failure = Some((SAGA_TIMEOUT_STEP_ID.to_string(), "saga timed out".to_string()));
                break;
            }

            let prior_results = instance.snapshot_prior_results();
            let mut futures = Vec::new();
            for step_id in &remaining {
                let Some(step) = definition.step(step_id) else { continue };
                let action = step.action.clone();
                let timeout = step.timeout.unwrap_or(definition.default_step_timeout);
                let ctx = StepContext {
                    saga_id: instance.id.clone(),
                    input: instance.input.clone(),
                    prior_results: prior_results.clone(),
                    cause: None,
                };
                let wal = self.wal.clone();
                let saga_id = instance.id.clone();
                let step_id = step_id.clone();
                futures.push(async move {
                    if let Err(e) = wal.append(WalEntry::new(&saga_id, WalEntryType::StepStarted, &step_id)).await {
                        return Err((step_id, e.to_string()));
                    }
                    match tokio::time::timeout(timeout, (action)(ctx)).await {
                        Ok(Ok(value)) => {
                            if let Err(e) = wal.append(WalEntry::new(&saga_id, WalEntryType::StepCompleted, &step_id)).await {
                                return Err((step_id, e.to_string()));
                            }
                            Ok((step_id, value))
                        }
                        Ok(Err(e)) => Err((step_id, e.to_string())),
                        Err(_) => Err((step_id, "step timed out".to_string())),
                    }
                });
            }

            for result in join_all(futures).await {
                match result {
                    Ok((step_id, value)) => {
                        match &self.checkpointer {
                            Some(checkpointer) => {
                                checkpointer.record_step_completion(instance, &step_id, value)?;
                            }
                            None => instance.mark_step_completed(&step_id, value),
                        }
                        self.snapshot(instance);
                    }
                    Err((step_id, reason)) => {
                        if first_failure.is_none() {
                            first_failure = Some((step_id, reason));
                        }
                    }
                }
            }
            if first_failure.is_some() {
                break;
            }
        }

        match first_failure {
            None => {
                instance.transition_to(SagaState::Completed)?;
                self.snapshot(instance);
                Ok(())
            }
            Some((step_id, reason)) => {
                instance.record_failure(step_id, reason.clone());
                self.branch_on_failure(definition, instance, &reason).await
            }
        }
    }
}
