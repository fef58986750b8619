//! Unix stack implementation using mmap

use super::{round_stack_size, StackBudget, StackLease, StackOptions};
use cofiber_core::StackError;

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

/// System page size (cached)
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// An mmap-backed fiber stack
///
/// Layout (stack grows down):
///
/// ```text
/// base            base + guard                      base + len
/// | guard (NONE)  | usable stack (RW)               | <- top
/// ```
///
/// The mapping is released on drop, together with the budget slot.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
    _lease: StackLease,
}

// Safety: the mapping is plain memory owned exclusively by this value
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    ///
    /// Memory is reserved lazily (MAP_NORESERVE where available), so large
    /// stacks only cost what the fiber actually touches.
    pub fn allocate(
        size: usize,
        options: StackOptions,
        budget: &Arc<StackBudget>,
    ) -> Result<Stack, StackError> {
        let usable = round_stack_size(size)?;
        let guard = if options.guard_page { page_size() } else { 0 };
        let len = usable.checked_add(guard).ok_or(StackError::TooLarge)?;
        let len_nz = NonZeroUsize::new(len).ok_or(StackError::TooLarge)?;

        // Claim the budget slot first so a refused stack never maps memory
        let lease = budget.try_acquire()?;

        let mut prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        if options.executable {
            prot |= ProtFlags::PROT_EXEC;
        }

        let mut flags = MapFlags::MAP_PRIVATE;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            flags |= MapFlags::MAP_NORESERVE | MapFlags::MAP_STACK;
        }

        let base = unsafe { mmap_anonymous(None, len_nz, prot, flags) }
            .map_err(|errno| StackError::Map(errno as i32))?;

        if guard > 0 {
            // Guard page at the low end traps overflow with SIGSEGV
            if let Err(errno) = unsafe { mprotect(base, guard, ProtFlags::PROT_NONE) } {
                let _ = unsafe { munmap(base, len) };
                return Err(StackError::Protect(errno as i32));
            }
        }

        Ok(Stack {
            base: base.cast(),
            len,
            guard,
            _lease: lease,
        })
    }

    /// Highest address of the stack (initial stack pointer)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest usable address
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { munmap(self.base.cast(), self.len) };
        if let Err(errno) = ret {
            tracing::warn!(%errno, len = self.len, "munmap of fiber stack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_touch() {
        let budget = StackBudget::unlimited();
        let stack = Stack::allocate(32 * 1024, StackOptions::default(), &budget).unwrap();
        assert!(stack.size() >= 32 * 1024);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
        assert_eq!(budget.live(), 1);

        // Both ends of the usable region are writable
        unsafe {
            stack.bottom().write(0xAA);
            stack.top().sub(1).write(0x55);
            assert_eq!(stack.bottom().read(), 0xAA);
        }

        drop(stack);
        assert_eq!(budget.live(), 0);
    }

    #[test]
    fn test_budget_refuses_mapping() {
        let budget = StackBudget::limited(1);
        let first = Stack::allocate(0, StackOptions::default(), &budget).unwrap();
        let err = Stack::allocate(0, StackOptions::default(), &budget).unwrap_err();
        assert_eq!(err, StackError::BudgetExhausted);
        drop(first);
        assert!(Stack::allocate(0, StackOptions::default(), &budget).is_ok());
    }

    #[test]
    fn test_without_guard_page() {
        let budget = StackBudget::unlimited();
        let options = StackOptions {
            guard_page: false,
            executable: false,
        };
        let stack = Stack::allocate(0, options, &budget).unwrap();
        assert_eq!(stack.bottom(), stack.base.as_ptr());
    }
}
