//! # cofiber - Cooperative Fiber Scheduler
//!
//! Stackful fibers multiplexed over a small pool of OS threads.
//!
//! ## Features
//!
//! - **Stackful**: every fiber owns an mmap'd stack with a guard page
//! - **Explicit suspension**: fibers leave the CPU only at `yield_now`,
//!   `sleep` or by returning; no preemption
//! - **Race-free sleep**: the scheduler asks `Fiber::can_sleep` under its
//!   lock before parking, so a wakeup is never lost
//! - **Messaging**: mailbox fibers and identity-routed delivery with
//!   `serde_json::Value` payloads
//!
//! ## Quick Start
//!
//! ```ignore
//! use cofiber::{Runtime, SchedulerConfig};
//!
//! fn main() -> cofiber::FiberResult<()> {
//!     let mut runtime = Runtime::new(SchedulerConfig::from_env())?;
//!
//!     runtime.block_on(|rt| {
//!         rt.spawn(|cx| {
//!             println!("Hello from fiber {}", cx.id());
//!             cx.yield_now();
//!             println!("Back again!");
//!         })
//!     })??;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        Fiber::run, yield_now, sleep, send_message           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FiberScheduler                           │
//! │     run queue, sleeping table, directory (one lock)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │   Loop    │      │   Loop    │      │   Loop    │
//!    │ (worker)  │      │ (worker)  │      │ (worker)  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │              ExecutionContext + Stack                   │
//!    │       naked-asm switch, mmap stacks, guard pages        │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use cofiber_core::{FiberError, FiberId, FiberResult, FiberState, IdAllocator, StackError};

// Re-export env utilities
pub use cofiber_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use cofiber_runtime::{
    current_fiber_id, current_worker, ExecutionContext, Fiber, FiberHandle, FiberScheduler,
    FiberWaker, FnFiber, Interrupt, Job, SchedulerConfig, SchedulerHandle, SchedulerStats,
    StackBudget, StackOptions, ThreadPool, WorkerPool,
};

// Re-export messaging
pub use cofiber_message::{
    FiberMessageCenter, Mailbox, MessagableFiber, Message, MessageContext, MessageHandler,
};

use std::time::Duration;

/// A scheduler, the thread pool its loops run on and a message center
///
/// Convenience for applications that don't bring their own pool.
pub struct Runtime {
    scheduler: FiberScheduler,
    pool: ThreadPool,
    center: FiberMessageCenter,
}

impl Runtime {
    /// Create a runtime; loops are not started yet
    pub fn new(config: SchedulerConfig) -> FiberResult<Self> {
        let pool = ThreadPool::new(config.num_workers);
        let scheduler = FiberScheduler::with_config(config)?;
        Ok(Self {
            scheduler,
            pool,
            center: FiberMessageCenter::new(),
        })
    }

    /// Start `num_workers` scheduling loops
    pub fn start(&self) -> FiberResult<()> {
        let workers = self.scheduler.config().num_workers;
        self.scheduler.start(&self.pool, workers)?;
        tracing::debug!(workers, "runtime started");
        Ok(())
    }

    /// Start, run `f`, wait for every fiber to exit, then shut down
    ///
    /// This is the typical entry point for applications. Fails with
    /// `Interrupted` if the scheduler is stopped before the fibers drain.
    pub fn block_on<F, T>(&mut self, f: F) -> FiberResult<T>
    where
        F: FnOnce(&Runtime) -> T,
    {
        self.start()?;
        let result = f(self);
        let drained = self.scheduler.wait_for_all_fibers_to_exit(false);
        self.shutdown();
        if !drained {
            return Err(FiberError::Interrupted);
        }
        Ok(result)
    }

    /// Spawn a closure fiber
    pub fn spawn<F>(&self, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce(&FiberHandle<'_>) + Send + 'static,
    {
        self.scheduler.spawn(f)
    }

    /// Add a fiber
    pub fn add_fiber<F: Fiber>(&self, fiber: F) -> FiberResult<FiberId> {
        self.scheduler.add_fiber(fiber)
    }

    /// Add a messagable fiber registered with this runtime's center
    pub fn spawn_messagable<H: MessageHandler>(&self, handler: H) -> FiberResult<FiberId> {
        self.center.add_fiber(&self.scheduler.handle(), handler)
    }

    /// Route a message by fiber identity
    pub fn send_message(&self, id: FiberId, msg: Message) -> bool {
        self.center.send_message(id, msg)
    }

    /// Wake a sleeping fiber
    pub fn wakeup(&self, id: FiberId) {
        self.scheduler.wakeup(id);
    }

    /// Wait for every fiber to exit (loops keep running)
    pub fn wait(&self) -> bool {
        self.scheduler.wait_for_all_fibers_to_exit(false)
    }

    /// Like `wait`, giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_all_fibers_to_exit_timeout(timeout, false)
    }

    pub fn scheduler(&self) -> &FiberScheduler {
        &self.scheduler
    }

    pub fn center(&self) -> &FiberMessageCenter {
        &self.center
    }

    /// Stop the loops and wait for their threads to exit
    ///
    /// Live fibers stay suspended; `start` resumes them.
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
        self.pool.join();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .field("pool", &self.pool)
            .finish()
    }
}
