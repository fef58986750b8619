//! Message delivery benchmarks
//!
//! Fibers are loaded with messages before the loops start, then drained.
//!
//! Run: `cargo bench --bench messages`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cofiber::{
    FiberMessageCenter, FiberScheduler, Message, MessageContext, MessageHandler, SchedulerConfig,
    ThreadPool,
};

struct Drain {
    remaining: usize,
    total: Arc<AtomicUsize>,
}

impl MessageHandler for Drain {
    fn process_messages(&mut self, _cx: &MessageContext<'_>, batch: &mut VecDeque<Message>) -> bool {
        self.total.fetch_add(batch.len(), Ordering::Relaxed);
        self.remaining = self.remaining.saturating_sub(batch.len());
        self.remaining > 0
    }
}

fn run_once(workers: usize, fibers: usize, messages: usize) {
    let config = SchedulerConfig::new().park_timeout(Duration::from_millis(1));
    let sched = FiberScheduler::with_config(config).unwrap();
    let pool = ThreadPool::new(workers);
    let center = FiberMessageCenter::new();
    let total = Arc::new(AtomicUsize::new(0));

    let ids: Vec<_> = (0..fibers)
        .map(|_| {
            center
                .add_fiber(
                    &sched.handle(),
                    Drain {
                        remaining: messages,
                        total: Arc::clone(&total),
                    },
                )
                .unwrap()
        })
        .collect();

    for id in &ids {
        for i in 0..messages {
            center.send_message(*id, json!(i));
        }
    }

    sched.start(&pool, workers).unwrap();
    assert!(sched.wait_for_all_fibers_to_exit(true));
    pool.join();
    assert_eq!(total.load(Ordering::Relaxed), fibers * messages);
}

fn bench_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("messages");
    group.sample_size(10);

    let (fibers, messages) = (50, 1000);
    for workers in [1, 4] {
        group.throughput(Throughput::Elements((fibers * messages) as u64));
        group.bench_with_input(
            BenchmarkId::new("preloaded", workers),
            &workers,
            |b, &workers| b.iter(|| run_once(workers, fibers, messages)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_messages);
criterion_main!(benches);
