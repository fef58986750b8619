//! Fibers
//!
//! A fiber is a user-supplied body (`Fiber`) wrapped by the scheduler in a
//! `FiberEntry` that carries its identity, lifecycle state and execution
//! context. Inside `run` the body talks to the scheduler through a
//! `FiberHandle`, which is only valid on the fiber's own stack.

use crate::context::ExecutionContext;
use crate::fatal;
use crate::scheduler::{SchedulerHandle, Shared};

use cofiber_core::{FiberId, FiberState};

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// User-extensible unit of cooperative work
///
/// `run` executes on the fiber's own stack and may suspend itself through
/// the handle it is given. Everything else is called by the scheduler from
/// whichever thread is doing bookkeeping at the time, hence `&self`
/// throughout: keep mutable state behind interior mutability.
pub trait Fiber: Send + Sync + 'static {
    /// Fiber body
    fn run(&self, cx: &FiberHandle<'_>);

    /// Called under the scheduler lock right before a sleeping fiber is
    /// parked; returning false keeps it runnable. Must not block or call
    /// back into the scheduler.
    fn can_sleep(&self) -> bool {
        true
    }

    /// Requested stack size in bytes (0 = scheduler default)
    fn stack_size(&self) -> usize {
        0
    }

    /// Called once by `add_fiber`, before the fiber can first run
    fn attach(&self, _id: FiberId, _waker: FiberWaker) {}
}

/// Fiber built from a closure
pub struct FnFiber<F> {
    body: Mutex<Option<F>>,
    stack_size: usize,
}

impl<F> FnFiber<F>
where
    F: FnOnce(&FiberHandle<'_>) + Send + 'static,
{
    pub fn new(body: F) -> Self {
        Self::with_stack_size(0, body)
    }

    pub fn with_stack_size(stack_size: usize, body: F) -> Self {
        Self {
            body: Mutex::new(Some(body)),
            stack_size,
        }
    }
}

impl<F> Fiber for FnFiber<F>
where
    F: FnOnce(&FiberHandle<'_>) + Send + 'static,
{
    fn run(&self, cx: &FiberHandle<'_>) {
        let body = self.body.lock().ok().and_then(|mut body| body.take());
        if let Some(body) = body {
            body(cx);
        }
    }

    fn stack_size(&self) -> usize {
        self.stack_size
    }
}

/// Wakes one fiber from any thread
///
/// Holds the scheduler weakly; waking after the scheduler is gone does
/// nothing.
#[derive(Clone)]
pub struct FiberWaker {
    id: FiberId,
    owner: Weak<Shared>,
}

impl FiberWaker {
    pub(crate) fn new(id: FiberId, owner: Weak<Shared>) -> Self {
        Self { id, owner }
    }

    /// Fiber this waker targets
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Wake the fiber if it is asleep (no-op otherwise)
    pub fn wake(&self) {
        if let Some(shared) = self.owner.upgrade() {
            shared.wakeup(self.id);
        }
    }
}

impl std::fmt::Debug for FiberWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FiberWaker").field(&self.id).finish()
    }
}

/// Scheduler-side record of one fiber
pub(crate) struct FiberEntry {
    pub(crate) id: FiberId,
    state: AtomicU8,
    pub(crate) context: ExecutionContext,
    pub(crate) body: Arc<dyn Fiber>,
    pub(crate) stack_size: usize,
    owner: Weak<Shared>,
}

impl FiberEntry {
    pub(crate) fn new(
        id: FiberId,
        body: Arc<dyn Fiber>,
        stack_size: usize,
        owner: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            state: AtomicU8::new(FiberState::New as u8),
            context: ExecutionContext::new(),
            body,
            stack_size,
            owner,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// First function run on a fresh fiber stack
///
/// `arg` is the address of the `FiberEntry`; the resuming loop holds a
/// reference to it for as long as the fiber executes.
pub(crate) extern "C" fn fiber_start(arg: usize) -> ! {
    let entry = unsafe { &*(arg as *const FiberEntry) };

    // Everything created here must be dropped before the final load_back,
    // which never returns
    {
        let handle = FiberHandle::new(entry);
        let result = panic::catch_unwind(AssertUnwindSafe(|| entry.body.run(&handle)));
        if let Err(payload) = result {
            tracing::error!(
                fiber = %entry.id,
                "fiber panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    entry.set_state(FiberState::Exited);
    unsafe { entry.context.load_back() }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// The running fiber's view of the scheduler
///
/// Only usable on the fiber's own stack, so it is neither `Send` nor
/// `Sync`.
pub struct FiberHandle<'a> {
    entry: &'a FiberEntry,
    _not_send: PhantomData<*const ()>,
}

impl<'a> FiberHandle<'a> {
    fn new(entry: &'a FiberEntry) -> Self {
        Self {
            entry,
            _not_send: PhantomData,
        }
    }

    /// This fiber's identity
    #[inline]
    pub fn id(&self) -> FiberId {
        self.entry.id
    }

    /// Hand control back to the scheduler; the fiber stays runnable
    pub fn yield_now(&self) {
        self.suspend();
    }

    /// Suspend until `wakeup` targets this fiber
    ///
    /// The scheduler consults `Fiber::can_sleep` before parking; if it
    /// refuses, this behaves like `yield_now`.
    pub fn sleep(&self) {
        self.entry.set_state(FiberState::Sleeping);
        self.suspend();
    }

    /// Wake this fiber by identity
    ///
    /// A running fiber is not asleep, so this only matters for a waker
    /// handed elsewhere; provided for symmetry with `SchedulerHandle::wakeup`.
    pub fn wakeup(&self) {
        self.waker().wake();
    }

    /// Waker for this fiber, usable from any thread
    pub fn waker(&self) -> FiberWaker {
        FiberWaker::new(self.entry.id, self.entry.owner.clone())
    }

    /// Handle to the owning scheduler, for adding or waking other fibers
    pub fn scheduler(&self) -> Option<SchedulerHandle> {
        self.entry
            .owner
            .upgrade()
            .map(|shared| SchedulerHandle::from_shared(&shared))
    }

    fn suspend(&self) {
        if !self.entry.context.is_running() {
            fatal!("fiber {} suspended while not executing", self.entry.id);
        }
        unsafe { self.entry.context.swap_back() };
    }
}

impl std::fmt::Debug for FiberHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.entry.id)
            .field("state", &self.entry.state())
            .finish()
    }
}
