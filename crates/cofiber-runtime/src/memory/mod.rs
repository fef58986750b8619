//! Fiber stack memory
//!
//! Each fiber owns an independently mapped stack. Platform-specific code
//! (mmap on unix) lives in the submodules; the live-stack budget here is
//! platform-agnostic.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("Unsupported platform");
    }
}

use cofiber_core::constants::{MAX_STACK_SIZE, MIN_STACK_SIZE};
use cofiber_core::StackError;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How a stack is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOptions {
    /// Keep one inaccessible page below the stack to trap overflow
    pub guard_page: bool,

    /// Map the stack PROT_EXEC as well
    pub executable: bool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            guard_page: true,
            executable: true,
        }
    }
}

/// Round a requested stack size to whole pages within the supported range
pub fn round_stack_size(requested: usize) -> Result<usize, StackError> {
    if requested > MAX_STACK_SIZE {
        return Err(StackError::TooLarge);
    }
    let page = page_size();
    let size = requested.max(MIN_STACK_SIZE);
    Ok(size.div_ceil(page) * page)
}

/// Upper bound on the number of stacks alive at once
///
/// Shared by all fibers of one scheduler. Each `Stack` holds a `StackLease`
/// that returns its slot when the stack is unmapped.
#[derive(Debug)]
pub struct StackBudget {
    limit: Option<usize>,
    live: AtomicUsize,
}

impl StackBudget {
    /// Budget with no limit (still counts live stacks)
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            limit: None,
            live: AtomicUsize::new(0),
        })
    }

    /// Budget allowing at most `limit` live stacks
    pub fn limited(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: Some(limit),
            live: AtomicUsize::new(0),
        })
    }

    /// Build from an optional limit
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        match limit {
            Some(n) => Self::limited(n),
            None => Self::unlimited(),
        }
    }

    /// Claim one stack slot
    pub fn try_acquire(self: &Arc<Self>) -> Result<StackLease, StackError> {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            if let Some(limit) = self.limit {
                if current >= limit {
                    return Err(StackError::BudgetExhausted);
                }
            }
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(StackLease {
                        budget: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of stacks currently alive
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Configured limit, if any
    #[inline]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// One claimed slot of a `StackBudget`
#[derive(Debug)]
pub struct StackLease {
    budget: Arc<StackBudget>,
}

impl Drop for StackLease {
    fn drop(&mut self) {
        self.budget.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_stack_size() {
        let page = page_size();
        assert_eq!(round_stack_size(0).unwrap(), MIN_STACK_SIZE.div_ceil(page) * page);
        let odd = MIN_STACK_SIZE + 1;
        let rounded = round_stack_size(odd).unwrap();
        assert_eq!(rounded % page, 0);
        assert!(rounded >= odd);
        assert_eq!(round_stack_size(MAX_STACK_SIZE + 1), Err(StackError::TooLarge));
    }

    #[test]
    fn test_default_options_map_rwx_with_guard() {
        let options = StackOptions::default();
        assert!(options.executable);
        assert!(options.guard_page);
    }

    #[test]
    fn test_budget_limits_live_leases() {
        let budget = StackBudget::limited(2);
        let a = budget.try_acquire().unwrap();
        let _b = budget.try_acquire().unwrap();
        assert_eq!(budget.live(), 2);
        assert_eq!(budget.try_acquire().unwrap_err(), StackError::BudgetExhausted);

        drop(a);
        assert_eq!(budget.live(), 1);
        assert!(budget.try_acquire().is_ok());
    }

    #[test]
    fn test_unlimited_budget_counts() {
        let budget = StackBudget::unlimited();
        let leases: Vec<_> = (0..16).map(|_| budget.try_acquire().unwrap()).collect();
        assert_eq!(budget.live(), 16);
        drop(leases);
        assert_eq!(budget.live(), 0);
    }
}
