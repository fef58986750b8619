//! Basic cofiber example
//!
//! Spawns a handful of fibers that yield, one that sleeps until the host
//! wakes it, and one that starts children of its own.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - Log filter (error, warn, info, debug, trace)
//! - `COFIBER_NUM_WORKERS=4` - Scheduling loops (see `SchedulerConfig::from_env`)

use cofiber::{FiberResult, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

// RUST_LOG=debug cargo run -p cofiber-basic
fn main() -> FiberResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    println!("=== cofiber Basic Example ===\n");

    let config = SchedulerConfig::from_env();
    println!("Workers: {}, stack size: {} KiB", config.num_workers, config.stack_size / 1024);

    let mut runtime = Runtime::new(config)?;
    let completed = Arc::new(AtomicUsize::new(0));

    runtime.block_on(|rt| -> FiberResult<()> {
        info!("spawning fibers");

        for i in 1..=3 {
            let c = Arc::clone(&completed);
            let id = rt.spawn(move |cx| {
                for j in 0..3 {
                    debug!(fiber = %cx.id(), worker = ?cofiber::current_worker(), "[fiber {}] iteration {}", i, j);
                    cx.yield_now();
                }
                c.fetch_add(1, Ordering::SeqCst);
            })?;
            println!("Spawned yielding fiber {} (ID={})", i, id);
        }

        let c = Arc::clone(&completed);
        let sleeper = rt.spawn(move |cx| {
            debug!(fiber = %cx.id(), "going to sleep");
            cx.sleep();
            debug!(fiber = %cx.id(), "woken up");
            c.fetch_add(1, Ordering::SeqCst);
        })?;
        println!("Spawned sleeping fiber (ID={})", sleeper);

        let c = Arc::clone(&completed);
        let parent = rt.spawn(move |cx| {
            let Some(handle) = cx.scheduler() else {
                return;
            };
            for n in 0..2 {
                let c = Arc::clone(&c);
                let _ = handle.spawn(move |child| {
                    debug!(fiber = %child.id(), "child {} running", n);
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
            c.fetch_add(1, Ordering::SeqCst);
        })?;
        println!("Spawned parent fiber (ID={})", parent);

        std::thread::sleep(Duration::from_millis(100));
        println!("\nWaking fiber {}", sleeper);
        rt.wakeup(sleeper);
        Ok(())
    })??;

    let stats = runtime.scheduler().stats();
    info!(?stats, "all fibers finished");
    println!(
        "\n{} fiber(s) completed, {} context switches",
        completed.load(Ordering::SeqCst),
        stats.context_switches
    );
    println!("\n=== Example Complete ===");
    Ok(())
}
