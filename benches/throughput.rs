//! Queue-level throughput benchmarks, using Criterion.
//!
//! Compares the relaxed queue against a lock-based strict baseline
//! (`parking_lot::Mutex<BinaryHeap>`) on single-thread and multi-thread
//! workloads.
//!
//! Run with: `cargo bench --bench throughput`

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread;

use criterion::{Criterion, criterion_group, criterion_main};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use klsm::KLsm;

const SINGLE_OPS: usize = 100_000;
const THREADS: usize = 4;
const OPS_PER_THREAD: usize = 25_000;

fn workload_keys(n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    (0..n).map(|_| u64::from(rng.gen::<u32>())).collect()
}

fn single_thread_insert_drain(c: &mut Criterion) {
    let keys: Vec<u64> = workload_keys(SINGLE_OPS);

    let mut group = c.benchmark_group("single_thread_insert_drain");

    group.bench_function("klsm_k256", |b| {
        b.iter(|| {
            let queue: KLsm<u64, u64, 256> = KLsm::new();
            let mut h = queue.handle();
            for &k in &keys {
                h.insert(k, k);
            }
            let mut acc: u64 = 0;
            while let Some(v) = h.delete_min() {
                acc = acc.wrapping_add(v);
            }
            acc
        });
    });

    group.bench_function("mutex_binary_heap", |b| {
        b.iter(|| {
            let heap: Mutex<BinaryHeap<Reverse<u64>>> = Mutex::new(BinaryHeap::new());
            for &k in &keys {
                heap.lock().push(Reverse(k));
            }
            let mut acc: u64 = 0;
            while let Some(Reverse(v)) = heap.lock().pop() {
                acc = acc.wrapping_add(v);
            }
            acc
        });
    });

    group.finish();
}

fn multi_thread_mixed(c: &mut Criterion) {
    let keys: Vec<u64> = workload_keys(THREADS * OPS_PER_THREAD);

    let mut group = c.benchmark_group("multi_thread_mixed_50_50");
    group.sample_size(10);

    group.bench_function("klsm_k256", |b| {
        b.iter(|| {
            let queue: KLsm<u64, u64, 256> = KLsm::new();
            thread::scope(|s| {
                for t in 0..THREADS {
                    let queue = &queue;
                    let chunk = &keys[t * OPS_PER_THREAD..(t + 1) * OPS_PER_THREAD];
                    s.spawn(move || {
                        let mut h = queue.handle();
                        for (i, &k) in chunk.iter().enumerate() {
                            if i % 2 == 0 {
                                h.insert(k, k);
                            } else {
                                let _ = h.delete_min();
                            }
                        }
                    });
                }
            });
        });
    });

    group.bench_function("mutex_binary_heap", |b| {
        b.iter(|| {
            let heap: Mutex<BinaryHeap<Reverse<u64>>> = Mutex::new(BinaryHeap::new());
            thread::scope(|s| {
                for t in 0..THREADS {
                    let heap = &heap;
                    let chunk = &keys[t * OPS_PER_THREAD..(t + 1) * OPS_PER_THREAD];
                    s.spawn(move || {
                        for (i, &k) in chunk.iter().enumerate() {
                            if i % 2 == 0 {
                                heap.lock().push(Reverse(k));
                            } else {
                                let _ = heap.lock().pop();
                            }
                        }
                    });
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, single_thread_insert_drain, multi_thread_mixed);
criterion_main!(benches);
