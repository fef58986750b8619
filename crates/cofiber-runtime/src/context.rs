//! Execution contexts
//!
//! An `ExecutionContext` is a resumable point of execution: a saved register
//! block plus, for fibers, the stack those registers point into. Scheduler
//! loops use a stackless context that simply captures the OS thread's own
//! stack on the first swap.
//!
//! Every context carries a single-slot back link to the context that last
//! swapped into it, so a fiber can always hand control back to whichever
//! scheduler loop resumed it without tracking that loop itself.

use crate::arch::{self, EntryFn, SavedRegs};
use crate::fatal;
use crate::memory::{Stack, StackBudget, StackOptions};

use cofiber_core::StackError;

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};

/// A resumable point of execution
pub struct ExecutionContext {
    /// Saved registers while this context is not executing
    regs: UnsafeCell<SavedRegs>,

    /// Context that last swapped into this one
    back: AtomicPtr<ExecutionContext>,

    /// Currently executing on some thread
    running: AtomicBool,

    /// Fiber stack; unset for thread contexts and uninitialized fibers
    stack: OnceLock<Stack>,
}

// Safety: `regs` is only read or written by the swap protocol below, and the
// scheduler never lets two threads swap into the same context at once.
unsafe impl Send for ExecutionContext {}
unsafe impl Sync for ExecutionContext {}

impl ExecutionContext {
    /// Context for a fiber whose stack is not materialized yet
    pub fn new() -> Self {
        Self {
            regs: UnsafeCell::new(SavedRegs::default()),
            back: AtomicPtr::new(ptr::null_mut()),
            running: AtomicBool::new(false),
            stack: OnceLock::new(),
        }
    }

    /// Context representing the calling OS thread
    ///
    /// It is already running; its registers are captured by the first
    /// `swap_to`.
    pub fn for_current_thread() -> Self {
        let ctx = Self::new();
        ctx.running.store(true, Ordering::Relaxed);
        ctx
    }

    /// Whether a stack has been materialized
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.stack.get().is_some()
    }

    /// Whether this context currently owns a CPU
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Usable stack size, if materialized
    pub fn stack_size(&self) -> Option<usize> {
        self.stack.get().map(Stack::size)
    }

    /// Allocate the stack and arrange for the first entry to call `entry(arg)`
    ///
    /// On failure nothing is changed and the call may simply be retried
    /// later. Initializing an already initialized context is a no-op.
    pub fn initialize(
        &self,
        entry: EntryFn,
        arg: usize,
        stack_size: usize,
        options: StackOptions,
        budget: &Arc<StackBudget>,
    ) -> Result<(), StackError> {
        if self.is_initialized() {
            return Ok(());
        }
        if self.is_running() {
            fatal!("initialize on a running execution context");
        }

        let stack = Stack::allocate(stack_size, options, budget)?;

        // Safety: not running and never entered, nobody else reads regs
        unsafe {
            arch::init_context(&mut *self.regs.get(), stack.top(), entry, arg);
        }
        self.back.store(ptr::null_mut(), Ordering::Relaxed);

        if self.stack.set(stack).is_err() {
            fatal!("execution context initialized twice");
        }
        Ok(())
    }

    /// Save the current state into `self` and transfer control to `other`
    ///
    /// `self` must be the context executing right now. Records `self` as
    /// `other`'s back link. Returns only when some context swaps back into
    /// `self`.
    ///
    /// # Safety
    ///
    /// `self` must be the currently executing context, `other` must be
    /// initialized (or a suspended thread context), and both must stay alive
    /// until control returns here.
    pub unsafe fn swap_to(&self, other: &ExecutionContext) {
        other
            .back
            .store(self as *const _ as *mut ExecutionContext, Ordering::Release);
        self.hand_over(other);
        arch::switch_context(self.regs.get(), other.regs.get());
    }

    /// Transfer control back to the context that last swapped into `self`
    ///
    /// # Safety
    ///
    /// `self` must be the currently executing context and must have been
    /// entered through `swap_to`.
    pub unsafe fn swap_back(&self) {
        let back = self.back_link();
        self.hand_over(back);
        arch::switch_context(self.regs.get(), back.regs.get());
    }

    /// One-way variant of `swap_back` for a context that is being abandoned
    ///
    /// Nothing is saved; `self` can never be resumed afterwards.
    ///
    /// # Safety
    ///
    /// Same as `swap_back`. Nothing on this context's stack is dropped.
    pub unsafe fn load_back(&self) -> ! {
        let back = self.back_link();
        self.hand_over(back);
        arch::load_context(back.regs.get())
    }

    /// Resolve the back link
    unsafe fn back_link(&self) -> &ExecutionContext {
        let back = self.back.load(Ordering::Acquire);
        if back.is_null() {
            fatal!("execution context has no context to return to");
        }
        &*back
    }

    /// Move the running flag from `self` to `next`
    fn hand_over(&self, next: &ExecutionContext) {
        if next.running.swap(true, Ordering::AcqRel) {
            fatal!("attempt to resume an execution context that is already running");
        }
        self.running.store(false, Ordering::Release);
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("initialized", &self.is_initialized())
            .field("running", &self.is_running())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}
