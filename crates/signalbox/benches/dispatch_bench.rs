//! Benchmarks for write coalescing and flush dispatch.
//!
//! Run with: cargo bench -p signalbox --bench dispatch_bench

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Map, Value, json};
use signalbox::{Observer, Signal, SignalOptions, SignalRegistry, StoreConfig, TaskQueue};
use std::hint::black_box;

/// A signal with `n` top-level counters, each observed at its own path.
fn make_signal(n: usize) -> (SignalRegistry, Signal, TaskQueue, Vec<Observer>) {
    let queue = TaskQueue::new();
    let registry = SignalRegistry::new(StoreConfig::default(), queue.clone());
    let state: Map<String, Value> = (0..n).map(|i| (format!("k{i}"), json!(0))).collect();
    let signal = registry.create("bench", state, SignalOptions::new().auto_destroy(false));
    let observers = (0..n)
        .map(|i| {
            let observer = Observer::new();
            let _ = signal.read_path(&observer, &format!("k{i}"));
            observer
        })
        .collect();
    (registry, signal, queue, observers)
}

fn bench_deep_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/deep");

    for n in [10, 100, 1000] {
        group.throughput(Throughput::Elements(n as u64));
        let (_registry, signal, queue, _observers) = make_signal(n);
        let paths: Vec<String> = (0..n).map(|i| format!("k{i}")).collect();
        group.bench_with_input(BenchmarkId::new("write_all_flush", n), &(), |b, _| {
            b.iter(|| {
                for (i, path) in paths.iter().enumerate() {
                    black_box(signal.set_path(path, json!(i)));
                }
                queue.run_until_idle()
            })
        });
    }

    group.finish();
}

fn bench_shallow_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/shallow");

    for writes in [1, 16, 256] {
        group.throughput(Throughput::Elements(writes as u64));
        let (_registry, signal, queue, _observers) = make_signal(100);
        group.bench_with_input(BenchmarkId::new("same_key", writes), &(), |b, _| {
            b.iter(|| {
                for i in 0..writes {
                    let mut patch = Map::new();
                    patch.insert("k0".to_owned(), json!(i));
                    black_box(signal.set_whole(patch));
                }
                queue.run_until_idle()
            })
        });
    }

    group.finish();
}

fn bench_path_read(c: &mut Criterion) {
    let (_registry, signal, _queue, observers) = make_signal(100);
    c.bench_function("read/cached_path", |b| {
        b.iter(|| black_box(signal.read_path(&observers[50], "k50").value))
    });
}

criterion_group!(
    benches,
    bench_deep_dispatch,
    bench_shallow_coalesce,
    bench_path_read
);
criterion_main!(benches);
