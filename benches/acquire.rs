// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named mutex acquisition benchmarks.
//
// Run with:
//   cargo bench --bench acquire
//
// Groups, each run once per available lock strategy:
//   uncontended: acquire + release on a mutex nobody else holds
//   recursive: re-entering a mutex the thread already owns
//   open_close: open and drop a handle to an existing name

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use named_mutex::{Config, LockStrategy, MutexAttributes, NamedMutex, SharedMemoryManager};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn strategies() -> Vec<(&'static str, LockStrategy)> {
    let mut all = vec![("file", LockStrategy::FileLock)];
    if LockStrategy::robust_supported() {
        all.push(("robust", LockStrategy::Robust));
    }
    all
}

fn setup(root: &std::path::Path, strategy: LockStrategy) -> (Arc<SharedMemoryManager>, NamedMutex) {
    let manager = SharedMemoryManager::new(
        Config::default()
            .with_runtime_temp_dir(root)
            .with_lock_strategy(strategy),
    );
    let name = format!("Global\\bench_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    let mutex = NamedMutex::create_in(&manager, &name, MutexAttributes::default(), false)
        .expect("create mutex");
    (manager, mutex)
}

// ---------------------------------------------------------------------------
// Uncontended acquire/release
// ---------------------------------------------------------------------------

fn bench_uncontended(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut group = c.benchmark_group("uncontended");

    for (label, strategy) in strategies() {
        let (_manager, mutex) = setup(temp.path(), strategy);
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            b.iter(|| {
                black_box(mutex.try_acquire_lock(0).expect("acquire"));
                mutex.release_lock().expect("release");
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Recursive acquisition while already owned
// ---------------------------------------------------------------------------

fn bench_recursive(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut group = c.benchmark_group("recursive");

    for (label, strategy) in strategies() {
        let (_manager, mutex) = setup(temp.path(), strategy);
        mutex.lock().expect("outer acquire");
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            b.iter(|| {
                black_box(mutex.try_acquire_lock(0).expect("acquire"));
                mutex.release_lock().expect("release");
            });
        });
        mutex.release_lock().expect("outer release");
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Open/close of an already-mapped name (registry hit)
// ---------------------------------------------------------------------------

fn bench_open_close(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut group = c.benchmark_group("open_close");

    for (label, strategy) in strategies() {
        let (manager, mutex) = setup(temp.path(), strategy);
        let name = mutex.id().to_string();
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            b.iter(|| {
                let handle = NamedMutex::open_in(&manager, &name, MutexAttributes::default())
                    .expect("open");
                black_box(handle)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_recursive, bench_open_close);
criterion_main!(benches);
