//! Thread-local storage for scheduler diagnostics
//!
//! Fibers migrate between OS threads at every suspension point, so the
//! accessors are `#[inline(never)]`: a TLS address computed before a yield
//! must not be reused after the fiber is resumed on a different thread.

use cofiber_core::FiberId;
use std::cell::Cell;

thread_local! {
    /// Scheduling loop index for this OS thread
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };

    /// Fiber currently executing on this thread
    static CURRENT_FIBER: Cell<u32> = const { Cell::new(0) };

    /// Address of the scheduler whose loop runs on this thread
    static LOOP_OWNER: Cell<usize> = const { Cell::new(0) };
}

/// Enter a scheduling loop on this thread
#[inline(never)]
pub(crate) fn enter_loop(owner: usize, worker: usize) {
    LOOP_OWNER.with(|cell| cell.set(owner));
    WORKER_ID.with(|cell| cell.set(worker));
}

/// Leave the scheduling loop (thread returns to the pool)
#[inline(never)]
pub(crate) fn leave_loop() {
    LOOP_OWNER.with(|cell| cell.set(0));
    WORKER_ID.with(|cell| cell.set(usize::MAX));
    CURRENT_FIBER.with(|cell| cell.set(0));
}

/// Scheduler address owning the loop on this thread (0 = none)
#[inline(never)]
pub(crate) fn loop_owner() -> usize {
    LOOP_OWNER.with(|cell| cell.get())
}

/// Record the fiber about to be resumed on this thread
#[inline(never)]
pub(crate) fn set_current_fiber(id: FiberId) {
    CURRENT_FIBER.with(|cell| cell.set(id.as_u32()));
}

/// Clear the current fiber (loop is back in control)
#[inline(never)]
pub(crate) fn clear_current_fiber() {
    CURRENT_FIBER.with(|cell| cell.set(0));
}

/// Identity of the fiber running on this thread, if any
#[inline(never)]
pub fn current_fiber_id() -> Option<FiberId> {
    FiberId::new(CURRENT_FIBER.with(|cell| cell.get())).to_option()
}

/// Index of the scheduling loop running on this thread, if any
#[inline(never)]
pub fn current_worker() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

/// Check if we're running inside a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    current_fiber_id().is_some()
}
