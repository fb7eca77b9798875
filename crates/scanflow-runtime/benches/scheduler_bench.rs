//! Benchmarks for observer ordering and notification passes.
//!
//! Run with: cargo bench -p scanflow-runtime -- scheduler

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use scanflow_core::{Container, ContainerRegistry};
use scanflow_runtime::{Observer, ObserverScheduler};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Chain of `len` observers, registered in reverse so the sort has to move
/// every node. Observer `i` reads container `i` and writes `i + 1`.
fn build_chain(len: usize) -> (ContainerRegistry, Vec<Container<u64>>, ObserverScheduler) {
    let registry = ContainerRegistry::new();
    let containers: Vec<Container<u64>> = (0..=len).map(|_| Container::new(&registry, 0)).collect();
    let scheduler = ObserverScheduler::new();
    for i in (0..len).rev() {
        let (src, dst) = (containers[i].clone(), containers[i + 1].clone());
        let body_src = src.clone();
        let body_dst = dst.clone();
        scheduler.add(
            Observer::new(format!("link-{i}"), move |_| {
                let v = *body_src.read();
                body_dst.update(|d, _| *d = v);
            })
            .observes(&src)
            .modifies(&dst),
        );
    }
    (registry, containers, scheduler)
}

// ---------------------------------------------------------------------------
// 1. Sort cost
// ---------------------------------------------------------------------------

fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/sort");
    for len in [8usize, 32, 128] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("reverse_chain", len), &len, |b, &len| {
            let (registry, _containers, scheduler) = build_chain(len);
            let extra: Container<u64> = Container::new(&registry, 0);
            b.iter(|| {
                // Add and remove a leaf to force a re-sort each iteration.
                let id = scheduler.add(Observer::new("leaf", |_| {}).observes(&extra));
                black_box(scheduler.execution_order().map(|order| order.len()).ok());
                scheduler.remove(id);
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Pass cost
// ---------------------------------------------------------------------------

fn bench_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/pass");
    for len in [8usize, 32, 128] {
        group.throughput(Throughput::Elements(len as u64));
        let (_registry, containers, scheduler) = build_chain(len);
        let _ = scheduler.notify_observers();

        group.bench_with_input(BenchmarkId::new("propagate", len), &(), |b, _| {
            b.iter(|| {
                containers[0].update(|v, _| *v += 1);
                black_box(scheduler.notify_observers().map(|r| r.ran).ok())
            })
        });

        group.bench_with_input(BenchmarkId::new("idle", len), &(), |b, _| {
            b.iter(|| black_box(scheduler.notify_observers().map(|r| r.unchanged).ok()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sort, bench_pass);
criterion_main!(benches);
