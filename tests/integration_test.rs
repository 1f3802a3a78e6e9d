//! End-to-end scenarios exercising the lane and saga subsystems together
//! through the crate's public API.

use laneforge::cancel::CancelToken;
use laneforge::core::checkpoint::{Checkpoint, CheckpointStore, Checkpointer};
use laneforge::core::compensation::{CompensationExecutor, IdempotencyStore};
use laneforge::core::fallback_lane::FallbackLane;
use laneforge::core::lane::{ChannelLane, LaneConfig, LaneHandle};
use laneforge::core::orchestrator::SagaOrchestrator;
use laneforge::core::recovery::RecoveryManager;
use laneforge::core::saga::{
    CompensationPolicy, SagaBuilder, SagaInstance, SagaState, Step, StepAction,
};
use laneforge::core::saga_store::SagaStore;
use laneforge::core::task::Task;
use laneforge::core::wal::{Wal, WalWriteMode};
use laneforge::errors::EngineError;
use laneforge::storage::KvStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ok_step(order: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> StepAction {
    Arc::new(move |_ctx| {
        let order = order.clone();
        Box::pin(async move {
            order.lock().unwrap().push(name);
            Ok(serde_json::json!({}))
        })
    })
}

fn failing_step(message: &'static str) -> StepAction {
    Arc::new(move |_ctx| Box::pin(async move { Err(EngineError::UserActionError(message.to_string())) }))
}

fn harness() -> (Arc<Wal>, Arc<Checkpointer>, Arc<CheckpointStore>, Arc<SagaOrchestrator>) {
    let kv = Arc::new(KvStore::temporary().unwrap());
    let wal = Wal::new(kv.clone(), WalWriteMode::Sync, 16);
    let checkpoint_store = Arc::new(CheckpointStore::new(kv.clone()));
    let checkpointer = Arc::new(Checkpointer::new(CheckpointStore::new(kv.clone())));
    let saga_store = Arc::new(SagaStore::new(kv.clone()));
    let idempotency = Arc::new(IdempotencyStore::new(kv));
    let compensation = Arc::new(CompensationExecutor::new(wal.clone(), idempotency));
    let orchestrator = SagaOrchestrator::new(wal.clone(), Some(checkpointer.clone()), Some(saga_store), compensation, 10);
    (wal, checkpointer, checkpoint_store, orchestrator)
}

/// S1 - linear saga completes in order.
#[tokio::test]
async fn linear_saga_happy_path() {
    let (_wal, _checkpointer, _checkpoints, orchestrator) = harness();
    let order = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaBuilder::new("linear", "linear saga")
        .step(Step::new("a", ok_step(order.clone(), "a")))
        .step(Step::new("b", ok_step(order.clone(), "b")).depends_on(["a"]))
        .step(Step::new("c", ok_step(order.clone(), "c")).depends_on(["b"]))
        .build()
        .unwrap();
    orchestrator.register_definition(definition);

    let cancel = CancelToken::new();
    let instance = orchestrator.execute("s1", "linear", serde_json::json!({}), &cancel).await.unwrap();

    assert_eq!(instance.state, SagaState::Completed);
    assert_eq!(instance.completed_steps, vec!["a", "b", "c"]);
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

/// S2 - a failing step under Auto policy compensates completed steps in
/// reverse order.
#[tokio::test]
async fn failure_triggers_auto_compensation_in_reverse_order() {
    let (_wal, _checkpointer, _checkpoints, orchestrator) = harness();
    let forward = Arc::new(Mutex::new(Vec::new()));
    let compensated = Arc::new(Mutex::new(Vec::new()));

    let comp_a = {
        let compensated = compensated.clone();
        let action: StepAction = Arc::new(move |_ctx| {
            let compensated = compensated.clone();
            Box::pin(async move {
                compensated.lock().unwrap().push("a");
                Ok(serde_json::json!({}))
            })
        });
        action
    };
    let comp_b = {
        let compensated = compensated.clone();
        let action: StepAction = Arc::new(move |_ctx| {
            let compensated = compensated.clone();
            Box::pin(async move {
                compensated.lock().unwrap().push("b");
                Ok(serde_json::json!({}))
            })
        });
        action
    };

    let definition = SagaBuilder::new("auto-comp", "auto compensation")
        .compensation_policy(CompensationPolicy::Auto)
        .step(Step::new("a", ok_step(forward.clone(), "a")).with_compensation(comp_a))
        .step(Step::new("b", ok_step(forward.clone(), "b")).depends_on(["a"]).with_compensation(comp_b))
        .step(Step::new("c", failing_step("boom")).depends_on(["b"]))
        .build()
        .unwrap();
    orchestrator.register_definition(definition);

    let cancel = CancelToken::new();
    let result = orchestrator.execute("s2", "auto-comp", serde_json::json!({}), &cancel).await;

    assert!(result.is_err());
    let instance = orchestrator.get("s2").unwrap();
    assert_eq!(instance.state, SagaState::Compensated);
    assert_eq!(*compensated.lock().unwrap(), vec!["b", "a"]);
    assert_eq!(instance.compensated_steps, vec!["b", "a"]);
}

/// S3 - independent steps in the same layer run concurrently; a
/// dependent final step waits for both.
#[tokio::test]
async fn parallel_layer_runs_independent_steps_before_the_final_step() {
    let (_wal, _checkpointer, _checkpoints, orchestrator) = harness();
    let order = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaBuilder::new("fan-out", "parallel layers")
        .step(Step::new("a", ok_step(order.clone(), "a")))
        .step(Step::new("b", ok_step(order.clone(), "b")).depends_on(["a"]))
        .step(Step::new("c", ok_step(order.clone(), "c")).depends_on(["a"]))
        .step(Step::new("d", ok_step(order.clone(), "d")).depends_on(["b", "c"]))
        .build()
        .unwrap();
    orchestrator.register_definition(definition);

    let cancel = CancelToken::new();
    let instance = orchestrator.execute("s3", "fan-out", serde_json::json!({}), &cancel).await.unwrap();

    assert_eq!(instance.state, SagaState::Completed);
    let order = order.lock().unwrap();
    assert_eq!(order[0], "a");
    assert_eq!(order[3], "d");
    assert!(order[1..3].contains(&"b") && order[1..3].contains(&"c"));
}

/// S4 - a lane pair degrades to the secondary after a connectivity
/// failure on the primary, and recovers once the primary is healthy
/// again.
#[tokio::test]
async fn redis_outage_degrades_to_fallback_and_recovers() {
    let primary = ChannelLane::new(LaneConfig::new("primary", 16, 2));
    let secondary = ChannelLane::new(LaneConfig::new("secondary", 16, 2));
    let secondary_completions = Arc::new(AtomicUsize::new(0));
    let primary_up = Arc::new(AtomicBool::new(false));

    let fallback = FallbackLane::new(
        "fallback",
        primary.clone(),
        secondary.clone(),
        Duration::from_millis(20),
        {
            let primary_up = primary_up.clone();
            move || {
                let primary_up = primary_up.clone();
                async move { primary_up.load(Ordering::SeqCst) }
            }
        },
    );

    let cancel = CancelToken::new();
    // Primary starts closed, so the first submit fails with a
    // connectivity-shaped error and flips the fallback into degraded mode.
    primary.close(&cancel).await.unwrap();

    let counter = secondary_completions.clone();
    let task = Task::new("t1", "fallback", 0, Box::new(move || {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }));
    let _ = fallback.submit(task, &cancel).await;
    assert!(fallback.is_degraded());
    assert_eq!(fallback.degrade_count(), 1);

    // Subsequent submissions route to the secondary lane.
    for i in 0..8 {
        let counter = secondary_completions.clone();
        let task = Task::new(format!("t{i}"), "fallback", 0, Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        fallback.submit(task, &cancel).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(secondary_completions.load(Ordering::SeqCst) >= 1);
}

/// S5 - manual compensation policy parks the saga at PendingCompensation
/// until explicitly triggered.
#[tokio::test]
async fn manual_policy_waits_for_explicit_compensation_trigger() {
    let (_wal, _checkpointer, _checkpoints, orchestrator) = harness();
    let compensated = Arc::new(Mutex::new(0u32));

    let comp_a = {
        let compensated = compensated.clone();
        let action: StepAction = Arc::new(move |_ctx| {
            let compensated = compensated.clone();
            Box::pin(async move {
                *compensated.lock().unwrap() += 1;
                Ok(serde_json::json!({}))
            })
        });
        action
    };

    let definition = SagaBuilder::new("manual", "manual compensation")
        .compensation_policy(CompensationPolicy::Manual)
        .step(Step::new("a", ok_step(Arc::new(Mutex::new(Vec::new())), "a")).with_compensation(comp_a))
        .step(Step::new("b", failing_step("boom")).depends_on(["a"]))
        .build()
        .unwrap();
    orchestrator.register_definition(definition);

    let cancel = CancelToken::new();
    let result = orchestrator.execute("s5", "manual", serde_json::json!({}), &cancel).await;
    assert!(result.is_err());
    assert_eq!(orchestrator.get("s5").unwrap().state, SagaState::PendingCompensation);
    assert_eq!(*compensated.lock().unwrap(), 0);

    orchestrator.trigger_compensation("s5", "operator requested").await.unwrap();
    assert_eq!(orchestrator.get("s5").unwrap().state, SagaState::Compensated);
    assert_eq!(*compensated.lock().unwrap(), 1);
}

/// S6 - a saga resumed from a checkpoint does not re-run completed
/// steps.
#[tokio::test]
async fn crash_recovery_skips_completed_steps() {
    let (_wal, _checkpointer, checkpoints, orchestrator) = harness();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaBuilder::new("recoverable", "recovery")
        .step(Step::new("a", ok_step(calls.clone(), "a")))
        .step(Step::new("b", ok_step(calls.clone(), "b")).depends_on(["a"]))
        .build()
        .unwrap();
    orchestrator.register_definition(definition);

    let mut instance = SagaInstance::new("s6", "recoverable", serde_json::json!({}));
    instance.state = SagaState::Running;
    instance.mark_step_completed("a", serde_json::json!({}));
    checkpoints.save(&Checkpoint { instance }).unwrap();

    let recovery = RecoveryManager::new(checkpoints, orchestrator.clone());
    let report = recovery.recover_all().await.unwrap();

    assert_eq!(report.outcomes.success, 1);
    assert_eq!(*calls.lock().unwrap(), vec!["b"]);
    assert_eq!(orchestrator.get("s6").unwrap().state, SagaState::Completed);
}
