//! Error types for the cofiber scheduler

use thiserror::Error;

/// Result type for scheduler operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors surfaced by the host-facing scheduler API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    /// `start` called while scheduling loops are still running
    #[error("scheduler already running")]
    AlreadyRunning,

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Every fiber identity is held by a registered fiber
    #[error("no fiber identities available")]
    IdsExhausted,

    /// Worker pool refused the job because it is at capacity
    #[error("worker pool exhausted")]
    PoolExhausted,

    /// OS thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// The scheduler behind a handle has been dropped
    #[error("scheduler has been dropped")]
    SchedulerGone,

    /// Waiting for fibers to drain was cut short by `stop` or a poisoned lock
    #[error("wait for fibers to exit was interrupted")]
    Interrupted,

    /// Stack could not be materialized
    #[error("stack error: {0}")]
    Stack(#[from] StackError),
}

/// Fiber stack allocation errors
///
/// These are recoverable: the scheduler leaves the fiber `New` and retries
/// after another fiber's stack has been reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    /// mmap failed
    #[error("stack mapping failed (errno {0})")]
    Map(i32),

    /// mprotect on the guard page failed
    #[error("guard page protection failed (errno {0})")]
    Protect(i32),

    /// The configured live-stack budget is spent
    #[error("stack budget exhausted")]
    BudgetExhausted,

    /// Requested size is above the supported maximum
    #[error("requested stack size too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FiberError::IdsExhausted;
        assert_eq!(e.to_string(), "no fiber identities available");

        let e = FiberError::Stack(StackError::Map(12));
        assert_eq!(e.to_string(), "stack error: stack mapping failed (errno 12)");
    }

    #[test]
    fn test_error_conversion() {
        let err: FiberError = StackError::BudgetExhausted.into();
        assert!(matches!(err, FiberError::Stack(StackError::BudgetExhausted)));
    }
}
