//! Benchmarks for lane submission and dequeue throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use laneforge::cancel::CancelToken;
use laneforge::core::lane::{ChannelLane, LaneConfig, LaneHandle};
use laneforge::core::task::Task;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn noop_task(id: &str, counter: Arc<AtomicUsize>) -> Task {
    Task::new(
        id,
        "bench-lane",
        0,
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }),
    )
}

fn bench_submit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let lane = ChannelLane::new(LaneConfig::new("bench", 10_000, 8));
    let cancel = CancelToken::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut counter_seq = 0u64;

    c.bench_function("lane_submit", |b| {
        b.to_async(&rt).iter(|| {
            counter_seq += 1;
            let lane = lane.clone();
            let cancel = cancel.clone();
            let task = noop_task(&format!("t{counter_seq}"), counter.clone());
            async move {
                let _ = lane.submit(black_box(task), &cancel).await;
            }
        })
    });
}

fn bench_try_submit(c: &mut Criterion) {
    let lane = ChannelLane::new(LaneConfig::new("bench-try", 10_000, 8));
    let counter = Arc::new(AtomicUsize::new(0));
    let mut counter_seq = 0u64;

    c.bench_function("lane_try_submit", |b| {
        b.iter(|| {
            counter_seq += 1;
            let task = noop_task(&format!("t{counter_seq}"), counter.clone());
            let _ = lane.try_submit(black_box(task));
        })
    });
}

criterion_group!(lane_benches, bench_submit, bench_try_submit);
criterion_main!(lane_benches);
