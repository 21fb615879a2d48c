//! Work-queue insertion/pop benchmarks across the untargeted, rank-targeted,
//! and parallel-task indices.

use adlb_rt::layout::{HostId, Layout};
use adlb_rt::workqueue::{Accuracy, Strictness, Target, Task, WorkQueue};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn layout(workers: i32) -> Layout {
    Layout::new(workers, 1, |_| 0 as HostId)
}

fn untargeted_task(priority: i64) -> Task {
    Task { ty: 0, priority, parallelism: 1, target: Target::Any, answer_rank: 0, payload: Vec::new() }
}

fn bench_put_untargeted(c: &mut Criterion) {
    let layout = layout(4);
    let mut group = c.benchmark_group("workqueue_put_untargeted");
    for &n in &[100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut wq = WorkQueue::new();
                for p in 0..n {
                    wq.put(&layout, untargeted_task(p as i64));
                }
                black_box(wq.count(0));
            });
        });
    }
    group.finish();
}

fn bench_pop_for_untargeted(c: &mut Criterion) {
    let layout = layout(4);
    let mut group = c.benchmark_group("workqueue_pop_for_untargeted");
    for &n in &[100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || {
                    let mut wq = WorkQueue::new();
                    for p in 0..n {
                        wq.put(&layout, untargeted_task(p as i64));
                    }
                    wq
                },
                |mut wq| {
                    for _ in 0..n {
                        black_box(wq.pop_for(&layout, 0, 0));
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_pop_for_rank_targeted(c: &mut Criterion) {
    let layout = layout(4);
    let mut group = c.benchmark_group("workqueue_pop_for_rank_targeted");
    group.bench_function("mixed_targets_1000", |b| {
        b.iter_batched(
            || {
                let mut wq = WorkQueue::new();
                for p in 0..1000 {
                    let target = Target::Rank((p % 4) as i32, Strictness::Hard, Accuracy::Rank);
                    wq.put(&layout, Task { ty: 0, priority: p as i64, parallelism: 1, target, answer_rank: (p % 4) as i32, payload: Vec::new() });
                }
                wq
            },
            |mut wq| {
                for rank in 0..4 {
                    while wq.pop_for(&layout, rank, 0).is_some() {}
                }
            },
            criterion::BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_put_untargeted, bench_pop_for_untargeted, bench_pop_for_rank_targeted);
criterion_main!(benches);
