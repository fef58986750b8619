//! Scheduler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use cofiber_runtime::config::SchedulerConfig;
//!
//! // Defaults with env overrides
//! let config = SchedulerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = SchedulerConfig::new()
//!     .num_workers(4)
//!     .stack_size(128 * 1024)
//!     .max_stacks(Some(256));
//! ```

use crate::memory::StackOptions;

use cofiber_core::constants::{
    DEFAULT_PARK_TIMEOUT_MS, DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MAX_WORKERS, MIN_STACK_SIZE,
};
use cofiber_core::{env_get, env_get_bool, FiberError, FiberResult};

use std::time::Duration;

/// Library defaults
pub mod defaults {
    use super::*;

    /// Scheduling loops when none are requested explicitly
    pub fn num_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS)
    }

    pub const STACK_SIZE: usize = DEFAULT_STACK_SIZE;
    pub const MAX_STACKS: usize = 0;
    pub const EXECUTABLE_STACKS: bool = true;
    pub const GUARD_PAGE: bool = true;
    pub const PARK_TIMEOUT_MS: u64 = DEFAULT_PARK_TIMEOUT_MS;
    pub const MAX_FIBER_ID: u32 = u32::MAX;
}

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Scheduling loops started by `Runtime`
    pub num_workers: usize,
    /// Stack size for fibers that ask for 0
    pub stack_size: usize,
    /// Maximum live stacks (`None` = unlimited)
    pub max_stacks: Option<usize>,
    /// Map stacks PROT_EXEC
    pub executable_stacks: bool,
    /// Keep a guard page below each stack
    pub guard_page: bool,
    /// How long an idle loop parks before re-checking for a stop request
    pub park_timeout: Duration,
    /// Largest identity handed out before wrapping
    pub max_fiber_id: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COFIBER_NUM_WORKERS` - Scheduling loops
    /// - `COFIBER_STACK_SIZE` - Default stack size in bytes
    /// - `COFIBER_MAX_STACKS` - Live stack limit (0 = unlimited)
    /// - `COFIBER_EXEC_STACKS` - Executable stacks (0/1)
    /// - `COFIBER_GUARD_PAGE` - Guard page below each stack (0/1)
    /// - `COFIBER_PARK_TIMEOUT_MS` - Idle park timeout in milliseconds
    /// - `COFIBER_MAX_FIBER_ID` - Identity wraparound point
    pub fn from_env() -> Self {
        let max_stacks = env_get("COFIBER_MAX_STACKS", defaults::MAX_STACKS);
        Self {
            num_workers: env_get("COFIBER_NUM_WORKERS", defaults::num_workers()),
            stack_size: env_get("COFIBER_STACK_SIZE", defaults::STACK_SIZE),
            max_stacks: (max_stacks != 0).then_some(max_stacks),
            executable_stacks: env_get_bool("COFIBER_EXEC_STACKS", defaults::EXECUTABLE_STACKS),
            guard_page: env_get_bool("COFIBER_GUARD_PAGE", defaults::GUARD_PAGE),
            park_timeout: Duration::from_millis(env_get(
                "COFIBER_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            max_fiber_id: env_get("COFIBER_MAX_FIBER_ID", defaults::MAX_FIBER_ID),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            num_workers: defaults::num_workers(),
            stack_size: defaults::STACK_SIZE,
            max_stacks: None,
            executable_stacks: defaults::EXECUTABLE_STACKS,
            guard_page: defaults::GUARD_PAGE,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            max_fiber_id: defaults::MAX_FIBER_ID,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_stacks(mut self, limit: Option<usize>) -> Self {
        self.max_stacks = limit;
        self
    }

    pub fn executable_stacks(mut self, enable: bool) -> Self {
        self.executable_stacks = enable;
        self
    }

    pub fn guard_page(mut self, enable: bool) -> Self {
        self.guard_page = enable;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn max_fiber_id(mut self, max: u32) -> Self {
        self.max_fiber_id = max;
        self
    }

    /// Stack mapping options derived from this config
    pub fn stack_options(&self) -> StackOptions {
        StackOptions {
            guard_page: self.guard_page,
            executable: self.executable_stacks,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> FiberResult<()> {
        if self.num_workers == 0 {
            return Err(FiberError::InvalidConfig("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(FiberError::InvalidConfig("num_workers must be <= 64"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidConfig("stack_size must be >= 16KB"));
        }
        if self.stack_size > MAX_STACK_SIZE {
            return Err(FiberError::InvalidConfig("stack_size must be <= 1GB"));
        }
        if self.max_stacks == Some(0) {
            return Err(FiberError::InvalidConfig("max_stacks must be > 0"));
        }
        if self.park_timeout.is_zero() {
            return Err(FiberError::InvalidConfig("park_timeout must be > 0"));
        }
        if self.max_fiber_id == 0 {
            return Err(FiberError::InvalidConfig("max_fiber_id must be > 0"));
        }
        Ok(())
    }
}
