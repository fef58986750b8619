//! # cofiber-runtime
//!
//! Platform-specific runtime for the cofiber cooperative scheduler.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Fiber stacks (mmap with guard pages, optional live-stack budget)
//! - Execution contexts, fibers and the scheduler state machine
//! - The worker-pool contract and a default thread pool
//! - Configuration and thread-local diagnostics

/// Log an internal invariant violation and abort the process
///
/// These indicate memory corruption or a protocol bug in the scheduler,
/// never a condition callers can handle.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        tracing::error!("{}", msg);
        eprintln!("cofiber: fatal: {}", msg);
        std::process::abort()
    }};
}
pub(crate) use fatal;

pub mod arch;
pub mod config;
pub mod context;
pub mod fiber;
pub mod memory;
pub mod scheduler;
pub mod tls;
pub mod worker;

// Re-exports
pub use config::SchedulerConfig;
pub use context::ExecutionContext;
pub use fiber::{Fiber, FiberHandle, FiberWaker, FnFiber};
pub use memory::{StackBudget, StackOptions};
pub use scheduler::{FiberScheduler, SchedulerHandle, SchedulerStats};
pub use tls::{current_fiber_id, current_worker};
pub use worker::{Interrupt, Job, ThreadPool, WorkerPool};
