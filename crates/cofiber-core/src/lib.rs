//! # cofiber-core
//!
//! Core types for the cofiber cooperative scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching and the scheduler itself live in `cofiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier and the two-mode identity allocator
//! - `state` - Fiber lifecycle state
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::{FiberId, IdAllocator};
pub use state::FiberState;
pub use error::{FiberError, FiberResult, StackError};
pub use env::{env_get, env_get_bool, env_get_opt};

/// Constants shared by the runtime crates
pub mod constants {
    /// Default stack size for a fiber that asks for 0
    pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

    /// Smallest stack the runtime will hand out
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Largest stack the runtime will hand out (1 GiB)
    pub const MAX_STACK_SIZE: usize = 1 << 30;

    /// Maximum scheduling loops per scheduler
    pub const MAX_WORKERS: usize = 64;

    /// Default time an idle scheduling loop parks before re-checking its interrupt
    pub const DEFAULT_PARK_TIMEOUT_MS: u64 = 100;
}
