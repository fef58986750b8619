//! Yield throughput benchmarks
//!
//! Mirrors the classic speed test: many fibers each yielding a few times,
//! for a range of fiber counts and worker counts.
//!
//! Run: `cargo bench --bench yield`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cofiber::{Fiber, FiberHandle, FiberScheduler, SchedulerConfig, ThreadPool};

struct Yielder {
    rounds: usize,
    total: Arc<AtomicUsize>,
}

impl Fiber for Yielder {
    fn run(&self, cx: &FiberHandle<'_>) {
        for _ in 0..self.rounds {
            self.total.fetch_add(1, Ordering::Relaxed);
            cx.yield_now();
        }
    }
}

fn run_once(workers: usize, fibers: usize, rounds: usize) {
    let config = SchedulerConfig::new().park_timeout(Duration::from_millis(1));
    let sched = FiberScheduler::with_config(config).unwrap();
    let pool = ThreadPool::new(workers);
    let total = Arc::new(AtomicUsize::new(0));

    for _ in 0..fibers {
        sched
            .add_fiber(Yielder {
                rounds,
                total: Arc::clone(&total),
            })
            .unwrap();
    }
    sched.start(&pool, workers).unwrap();
    assert!(sched.wait_for_all_fibers_to_exit(true));
    pool.join();
    assert_eq!(total.load(Ordering::Relaxed), fibers * rounds);
}

fn bench_yield(c: &mut Criterion) {
    let mut group = c.benchmark_group("yield");
    group.sample_size(10);

    for (fibers, rounds) in [(300, 100), (10_000, 3)] {
        for workers in [1, 4] {
            group.throughput(Throughput::Elements((fibers * rounds) as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{}x{}", fibers, rounds), workers),
                &workers,
                |b, &workers| b.iter(|| run_once(workers, fibers, rounds)),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_yield);
criterion_main!(benches);
