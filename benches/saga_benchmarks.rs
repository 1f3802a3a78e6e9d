//! Benchmarks for saga orchestration: execution and status lookup.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use laneforge::core::checkpoint::{CheckpointStore, Checkpointer};
use laneforge::core::compensation::{CompensationExecutor, IdempotencyStore};
use laneforge::core::orchestrator::SagaOrchestrator;
use laneforge::core::saga::{SagaBuilder, Step};
use laneforge::core::saga_store::SagaStore;
use laneforge::core::wal::{Wal, WalWriteMode};
use laneforge::storage::KvStore;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn ok_action() -> laneforge::core::saga::StepAction {
    Arc::new(|_ctx| Box::pin(async { Ok(serde_json::json!({})) }))
}

fn build_orchestrator() -> Arc<SagaOrchestrator> {
    let kv = Arc::new(KvStore::temporary().unwrap());
    let wal = Wal::new(kv.clone(), WalWriteMode::Sync, 16);
    let checkpointer = Arc::new(Checkpointer::new(CheckpointStore::new(kv.clone())));
    let saga_store = Arc::new(SagaStore::new(kv.clone()));
    let idempotency = Arc::new(IdempotencyStore::new(kv));
    let compensation = Arc::new(CompensationExecutor::new(wal.clone(), idempotency));
    let orchestrator = SagaOrchestrator::new(wal, Some(checkpointer), Some(saga_store), compensation, 100);

    let definition = SagaBuilder::new("bench-saga", "benchmark")
        .step(Step::new("step1", ok_action()))
        .step(Step::new("step2", ok_action()).depends_on(["step1"]))
        .build()
        .unwrap();
    orchestrator.register_definition(definition);
    orchestrator
}

fn bench_saga_execute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let orchestrator = build_orchestrator();
    let mut counter = 0u64;

    c.bench_function("saga_execute", |b| {
        b.to_async(&rt).iter(|| {
            counter += 1;
            let instance_id = format!("bench-{counter}");
            let orchestrator = orchestrator.clone();
            async move {
                let cancel = laneforge::cancel::CancelToken::new();
                let _ = orchestrator
                    .execute(black_box(instance_id), black_box("bench-saga"), serde_json::json!({}), &cancel)
                    .await;
            }
        })
    });
}

fn bench_saga_get_status(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let orchestrator = build_orchestrator();
    rt.block_on(async {
        let cancel = laneforge::cancel::CancelToken::new();
        let _ = orchestrator.execute("seed", "bench-saga", serde_json::json!({}), &cancel).await;
    });

    c.bench_function("saga_get_status", |b| {
        b.iter(|| orchestrator.get(black_box("seed")));
    });
}

criterion_group!(saga_benches, bench_saga_execute, bench_saga_get_status);
criterion_main!(saga_benches);
