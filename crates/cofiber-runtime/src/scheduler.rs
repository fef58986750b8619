//! Fiber scheduler
//!
//! One lock guards the run queue, the sleeping table and the fiber
//! directory. It is held only for bookkeeping, never while a fiber runs.
//! Each scheduling loop:
//!
//! 1. picks the next runnable fiber under the lock (reclaiming exited ones
//!    on the way),
//! 2. materializes its stack if it is new,
//! 3. swaps into it without the lock held,
//! 4. re-takes the lock and files the fiber according to the state it left
//!    itself in (sleeping, runnable, exited).
//!
//! A fiber never parks itself. It only marks itself `Sleeping` and swaps
//! out; the loop that resumed it decides, under the lock and after asking
//! `Fiber::can_sleep`, whether it really goes to the sleeping table. A
//! wakeup therefore either finds the fiber in the table or happens before
//! the `can_sleep` check and is seen by it.

use crate::config::SchedulerConfig;
use crate::context::ExecutionContext;
use crate::fatal;
use crate::fiber::{fiber_start, Fiber, FiberEntry, FiberHandle, FiberWaker, FnFiber};
use crate::memory::StackBudget;
use crate::tls;
use crate::worker::{Interrupt, Job, Latch, WorkerPool};

use cofiber_core::constants::MAX_WORKERS;
use cofiber_core::{FiberError, FiberId, FiberResult, FiberState, IdAllocator};

use tracing::{debug, trace, warn};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Fibers in the directory (not yet reclaimed)
    pub fibers: usize,
    /// Fibers in the run queue
    pub queued: usize,
    /// Fibers parked in the sleeping table
    pub sleeping: usize,
    /// Stacks currently mapped
    pub live_stacks: usize,
    /// Swaps from a scheduling loop into a fiber
    pub context_switches: u64,
    /// Failed stack materializations
    pub stack_failures: u64,
    /// Fibers reclaimed after exiting
    pub reclaimed: u64,
}

/// Tables guarded by the scheduler lock
struct SchedState {
    /// Runnable fibers (`New`, `Running`, `Waking`) and exited ones awaiting
    /// reclamation
    queue: VecDeque<Arc<FiberEntry>>,

    /// Every fiber not yet reclaimed
    fibers: HashMap<FiberId, Arc<FiberEntry>>,

    /// Parked fibers
    sleeping: HashMap<FiberId, Arc<FiberEntry>>,

    ids: IdAllocator,

    /// A stack allocation failed; don't retry until a stack is reclaimed
    stack_blocked: bool,

    /// Bumped by every `stop`; interrupts drain waiters
    stop_generation: u64,
}

/// A started scheduling loop
struct LoopHandle {
    worker: usize,
    interrupt: Interrupt,
    done: Arc<Latch>,
}

/// State shared by the scheduler, its loops and every handle
pub(crate) struct Shared {
    state: Mutex<SchedState>,

    /// Signaled when a fiber becomes runnable
    fiber_available: Condvar,

    /// Signaled when the directory drains (or on stop)
    no_fibers: Condvar,

    config: SchedulerConfig,
    budget: Arc<StackBudget>,
    loops: Mutex<Vec<LoopHandle>>,

    context_switches: AtomicU64,
    stack_failures: AtomicU64,
    reclaimed: AtomicU64,
}

impl Shared {
    fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SchedState {
                queue: VecDeque::new(),
                fibers: HashMap::new(),
                sleeping: HashMap::new(),
                ids: IdAllocator::with_max(config.max_fiber_id),
                stack_blocked: false,
                stop_generation: 0,
            }),
            fiber_available: Condvar::new(),
            no_fibers: Condvar::new(),
            budget: StackBudget::new(config.max_stacks),
            config,
            loops: Mutex::new(Vec::new()),
            context_switches: AtomicU64::new(0),
            stack_failures: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Identity used to recognise this scheduler's loops in TLS
    #[inline]
    fn key(&self) -> usize {
        self as *const Shared as usize
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- host/fiber facing operations ----

    fn add(self: &Arc<Self>, body: Arc<dyn Fiber>) -> FiberResult<FiberId> {
        let stack_size = match body.stack_size() {
            0 => self.config.stack_size,
            n => n,
        };

        // Reserve the identity in the directory first, so `attach` runs
        // without the lock but before any loop can see the fiber
        let entry = {
            let mut st = self.lock();
            let SchedState { ids, fibers, .. } = &mut *st;
            let id = ids
                .allocate(|id| fibers.contains_key(&id))
                .ok_or(FiberError::IdsExhausted)?;
            let entry = Arc::new(FiberEntry::new(
                id,
                Arc::clone(&body),
                stack_size,
                Arc::downgrade(self),
            ));
            fibers.insert(id, Arc::clone(&entry));
            entry
        };

        let id = entry.id;
        body.attach(id, FiberWaker::new(id, Arc::downgrade(self)));

        self.lock().queue.push_back(entry);
        self.fiber_available.notify_one();

        debug!(fiber = %id, stack_size, "fiber added");
        Ok(id)
    }

    pub(crate) fn wakeup(&self, id: FiberId) {
        let mut st = self.lock();
        if let Some(fiber) = st.sleeping.remove(&id) {
            fiber.set_state(FiberState::Waking);
            st.queue.push_back(fiber);
            drop(st);
            self.fiber_available.notify_one();
            trace!(fiber = %id, "fiber woken");
        }
    }

    fn contains(&self, id: FiberId) -> bool {
        self.lock().fibers.contains_key(&id)
    }

    fn fiber_count(&self) -> usize {
        self.lock().fibers.len()
    }

    fn stats(&self) -> SchedulerStats {
        let st = self.lock();
        SchedulerStats {
            fibers: st.fibers.len(),
            queued: st.queue.len(),
            sleeping: st.sleeping.len(),
            live_stacks: self.budget.live(),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            stack_failures: self.stack_failures.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    // ---- loop control ----

    fn start(self: &Arc<Self>, pool: &dyn WorkerPool, num_workers: usize) -> FiberResult<()> {
        if num_workers == 0 || num_workers > MAX_WORKERS {
            return Err(FiberError::InvalidConfig("num_workers must be in 1..=64"));
        }

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if loops.iter().any(|l| !l.done.is_released()) {
            return Err(FiberError::AlreadyRunning);
        }
        loops.clear();

        for worker in 0..num_workers {
            let interrupt = Interrupt::new();
            let done = Latch::new();

            let job: Job = {
                let shared = Arc::clone(self);
                let interrupt = interrupt.clone();
                let done = Arc::clone(&done);
                Box::new(move || {
                    let release = ReleaseOnDrop(done);
                    shared.run_loop(worker, &interrupt);
                    drop(shared);
                    drop(release);
                })
            };

            if let Err(err) = pool.execute(&format!("cofiber-worker-{}", worker), job) {
                warn!(worker, %err, "failed to start scheduling loop");
                drop(loops);
                self.stop();
                return Err(err);
            }

            loops.push(LoopHandle {
                worker,
                interrupt,
                done,
            });
        }

        debug!(num_workers, "scheduler started");
        Ok(())
    }

    fn stop(&self) {
        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner));
        for l in &loops {
            l.interrupt.interrupt();
        }

        {
            let mut st = self.lock();
            st.stop_generation += 1;
            self.fiber_available.notify_all();
            self.no_fibers.notify_all();
        }

        // A fiber may stop its own scheduler; its loop only notices once the
        // fiber hands control back, so don't wait for that one
        let own_loop = if tls::loop_owner() == self.key() {
            warn!("stop requested from inside a scheduling loop");
            tls::current_worker()
        } else {
            None
        };

        for l in loops {
            if Some(l.worker) != own_loop {
                l.done.wait();
            }
        }
        debug!("scheduler stopped");
    }

    fn is_running(&self) -> bool {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|l| !l.done.is_released())
    }

    /// Block until the directory is empty
    ///
    /// Returns false if a `stop` happens meanwhile, the lock is poisoned, or
    /// the deadline passes.
    fn wait_drained(&self, deadline: Option<Instant>) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };
        let generation = st.stop_generation;

        while !st.fibers.is_empty() {
            if st.stop_generation != generation {
                return false;
            }
            st = match deadline {
                None => match self.no_fibers.wait(st) {
                    Ok(st) => st,
                    Err(_) => return false,
                },
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.no_fibers.wait_timeout(st, deadline - now) {
                        Ok((st, _)) => st,
                        Err(_) => return false,
                    }
                }
            };
        }
        true
    }

    // ---- scheduling loop ----

    fn run_loop(self: &Arc<Self>, worker: usize, interrupt: &Interrupt) {
        tls::enter_loop(self.key(), worker);
        debug!(worker, "scheduling loop started");

        // Captures this thread's own stack on the first swap
        let loop_context = ExecutionContext::for_current_thread();

        while let Some(fiber) = self.next_fiber(interrupt) {
            if !fiber.context.is_initialized() && !self.materialize(&fiber) {
                continue;
            }

            tls::set_current_fiber(fiber.id);
            self.context_switches.fetch_add(1, Ordering::Relaxed);

            // Safety: the fiber was taken off the queue under the lock, so no
            // other loop can resume it, and `fiber` keeps it alive until it
            // swaps back
            unsafe { loop_context.swap_to(&fiber.context) };

            tls::clear_current_fiber();
            self.requeue(fiber);
        }

        debug!(worker, "scheduling loop stopped");
        tls::leave_loop();
    }

    /// Allocate a new fiber's stack; on failure put it back and return false
    fn materialize(&self, fiber: &Arc<FiberEntry>) -> bool {
        let reclaimed_before = self.reclaimed.load(Ordering::Acquire);
        let result = fiber.context.initialize(
            fiber_start,
            Arc::as_ptr(fiber) as usize,
            fiber.stack_size,
            self.config.stack_options(),
            &self.budget,
        );

        let Err(err) = result else {
            fiber.set_state(FiberState::Running);
            return true;
        };

        self.stack_failures.fetch_add(1, Ordering::Relaxed);
        warn!(fiber = %fiber.id, %err, "fiber stack allocation failed");

        let mut st = self.lock();
        st.queue.push_back(Arc::clone(fiber));
        if self.reclaimed.load(Ordering::Acquire) == reclaimed_before {
            // Nothing was freed meanwhile; wait for the next reclamation
            st.stack_blocked = true;
        } else {
            drop(st);
            self.fiber_available.notify_one();
        }
        false
    }

    /// Next fiber to resume, or `None` once interrupted
    fn next_fiber(&self, interrupt: &Interrupt) -> Option<Arc<FiberEntry>> {
        let mut st = self.lock();
        loop {
            if interrupt.is_interrupted() {
                return None;
            }
            if let Some(fiber) = self.select(&mut st) {
                return Some(fiber);
            }
            st = self
                .fiber_available
                .wait_timeout(st, self.config.park_timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// One pass over the run queue
    fn select(&self, st: &mut SchedState) -> Option<Arc<FiberEntry>> {
        // First new fiber skipped because stacks are blocked; seeing it again
        // means a full pass found nothing runnable
        let mut cycle_end = None;

        while let Some(fiber) = st.queue.pop_front() {
            match fiber.state() {
                FiberState::Waking => {
                    fiber.set_state(FiberState::Running);
                    return Some(fiber);
                }
                FiberState::Running => return Some(fiber),
                FiberState::New => {
                    if !st.stack_blocked {
                        return Some(fiber);
                    }
                    if cycle_end == Some(fiber.id) {
                        st.queue.push_front(fiber);
                        return None;
                    }
                    cycle_end.get_or_insert(fiber.id);
                    st.queue.push_back(fiber);
                }
                FiberState::Exited | FiberState::Dead => self.reclaim(st, fiber),
                FiberState::Sleeping => {
                    fatal!("sleeping fiber {} found in the run queue", fiber.id);
                }
            }
        }
        None
    }

    /// Drop an exited fiber, releasing its stack
    fn reclaim(&self, st: &mut SchedState, fiber: Arc<FiberEntry>) {
        fiber.set_state(FiberState::Dead);
        st.fibers.remove(&fiber.id);
        let id = fiber.id;
        drop(fiber);

        self.reclaimed.fetch_add(1, Ordering::AcqRel);
        if std::mem::take(&mut st.stack_blocked) {
            self.fiber_available.notify_all();
        }
        debug!(fiber = %id, remaining = st.fibers.len(), "fiber reclaimed");

        if st.fibers.is_empty() {
            self.no_fibers.notify_all();
        }
    }

    /// File a fiber that just swapped back to its loop
    fn requeue(&self, fiber: Arc<FiberEntry>) {
        let mut st = self.lock();
        match fiber.state() {
            FiberState::Sleeping => {
                if fiber.body.can_sleep() {
                    trace!(fiber = %fiber.id, "fiber parked");
                    st.sleeping.insert(fiber.id, fiber);
                } else {
                    fiber.set_state(FiberState::Running);
                    st.queue.push_back(fiber);
                    drop(st);
                    self.fiber_available.notify_one();
                }
            }
            FiberState::Running => {
                st.queue.push_back(fiber);
                drop(st);
                self.fiber_available.notify_one();
            }
            FiberState::Exited => {
                st.queue.push_front(fiber);
                drop(st);
                self.fiber_available.notify_one();
            }
            // Already queued by whoever woke it
            FiberState::Waking => {}
            state @ (FiberState::New | FiberState::Dead) => {
                fatal!("fiber {} returned to its scheduler as {}", fiber.id, state);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for fiber in st.fibers.values() {
            fiber.set_state(FiberState::Dead);
        }
        if !st.fibers.is_empty() {
            debug!(count = st.fibers.len(), "freeing fibers left in scheduler");
        }
        st.queue.clear();
        st.sleeping.clear();
        st.fibers.clear();
    }
}

/// Releases a loop's completion latch even if the loop unwinds
struct ReleaseOnDrop(Arc<Latch>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Cooperative fiber scheduler
///
/// Owns every fiber added to it. Scheduling loops run on threads borrowed
/// from a `WorkerPool` between `start` and `stop`; fibers may be added and
/// woken at any time, from any thread. Dropping the scheduler stops it and
/// frees all remaining fibers without resuming them.
pub struct FiberScheduler {
    shared: Arc<Shared>,
}

impl FiberScheduler {
    /// Scheduler with library defaults
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(SchedulerConfig::new())),
        }
    }

    /// Scheduler with a validated config
    pub fn with_config(config: SchedulerConfig) -> FiberResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config)),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Start `num_workers` scheduling loops on `pool`
    ///
    /// Fails with `AlreadyRunning` while loops from a previous `start` are
    /// still alive. If the pool refuses a loop, the ones already started are
    /// stopped again.
    pub fn start(&self, pool: &dyn WorkerPool, num_workers: usize) -> FiberResult<()> {
        self.shared.start(pool, num_workers)
    }

    /// Stop all scheduling loops and wait for them to return
    ///
    /// Fibers are not forced to exit; they resume on the next `start`.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Whether scheduling loops are running
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Add a fiber; it becomes runnable immediately
    pub fn add_fiber<F: Fiber>(&self, fiber: F) -> FiberResult<FiberId> {
        self.shared.add(Arc::new(fiber))
    }

    /// Add a fiber the caller keeps a reference to
    pub fn add_fiber_arc(&self, fiber: Arc<dyn Fiber>) -> FiberResult<FiberId> {
        self.shared.add(fiber)
    }

    /// Add a closure fiber
    pub fn spawn<F>(&self, body: F) -> FiberResult<FiberId>
    where
        F: FnOnce(&FiberHandle<'_>) + Send + 'static,
    {
        self.add_fiber(FnFiber::new(body))
    }

    /// Wake a sleeping fiber; no-op for any other state
    pub fn wakeup(&self, id: FiberId) {
        self.shared.wakeup(id);
    }

    /// Whether `id` names a fiber that has not been reclaimed
    pub fn contains(&self, id: FiberId) -> bool {
        self.shared.contains(id)
    }

    /// Fibers not yet reclaimed
    pub fn fiber_count(&self) -> usize {
        self.shared.fiber_count()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    /// Cloneable handle usable from other threads and from fibers
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::from_shared(&self.shared)
    }

    /// Block until every fiber has exited and been reclaimed
    ///
    /// Returns false if interrupted by a concurrent `stop` (or a poisoned
    /// lock). When `stop_after` is set and the wait succeeded, the scheduler
    /// is stopped before returning.
    pub fn wait_for_all_fibers_to_exit(&self, stop_after: bool) -> bool {
        let drained = self.shared.wait_drained(None);
        if drained && stop_after {
            self.stop();
        }
        drained
    }

    /// Like `wait_for_all_fibers_to_exit`, giving up after `timeout`
    pub fn wait_for_all_fibers_to_exit_timeout(&self, timeout: Duration, stop_after: bool) -> bool {
        let drained = self.shared.wait_drained(Some(Instant::now() + timeout));
        if drained && stop_after {
            self.stop();
        }
        drained
    }
}

impl Default for FiberScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FiberScheduler {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl std::fmt::Debug for FiberScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberScheduler")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Weak, cloneable handle to a scheduler
///
/// Safe to keep inside fibers: it does not keep the scheduler alive.
/// Operations fail with `SchedulerGone` (or do nothing) once the scheduler
/// has been dropped.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Weak<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn from_shared(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    fn upgrade(&self) -> FiberResult<Arc<Shared>> {
        self.shared.upgrade().ok_or(FiberError::SchedulerGone)
    }

    pub fn add_fiber<F: Fiber>(&self, fiber: F) -> FiberResult<FiberId> {
        self.upgrade()?.add(Arc::new(fiber))
    }

    pub fn add_fiber_arc(&self, fiber: Arc<dyn Fiber>) -> FiberResult<FiberId> {
        self.upgrade()?.add(fiber)
    }

    pub fn spawn<F>(&self, body: F) -> FiberResult<FiberId>
    where
        F: FnOnce(&FiberHandle<'_>) + Send + 'static,
    {
        self.add_fiber(FnFiber::new(body))
    }

    pub fn wakeup(&self, id: FiberId) {
        if let Some(shared) = self.shared.upgrade() {
            shared.wakeup(id);
        }
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.shared.upgrade().is_some_and(|s| s.contains(id))
    }

    pub fn fiber_count(&self) -> usize {
        self.shared.upgrade().map_or(0, |s| s.fiber_count())
    }

    /// Stop the scheduling loops; no-op once the scheduler is gone
    pub fn stop(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop();
        }
    }

    /// Waker for `id`
    pub fn waker(&self, id: FiberId) -> FiberWaker {
        FiberWaker::new(id, self.shared.clone())
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ThreadPool;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(30);

    fn scheduler(config: SchedulerConfig) -> FiberScheduler {
        FiberScheduler::with_config(config.park_timeout(Duration::from_millis(10))).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_ten_fibers_ten_yields_one_worker() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(2);
        let yields = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let yields = Arc::clone(&yields);
            sched
                .spawn(move |cx| {
                    for _ in 0..10 {
                        yields.fetch_add(1, Ordering::SeqCst);
                        cx.yield_now();
                    }
                })
                .unwrap();
        }

        sched.start(&pool, 1).unwrap();
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert_eq!(yields.load(Ordering::SeqCst), 100);
        assert_eq!(sched.fiber_count(), 0);
        assert!(!sched.is_running());

        let stats = sched.stats();
        assert_eq!(stats.reclaimed, 10);
        assert_eq!(stats.live_stacks, 0);
        assert!(stats.context_switches >= 110);
    }

    struct Exclusive {
        active: AtomicBool,
        rounds: usize,
        done: Arc<AtomicUsize>,
    }

    impl Fiber for Exclusive {
        fn run(&self, cx: &FiberHandle<'_>) {
            for _ in 0..self.rounds {
                assert!(!self.active.swap(true, Ordering::SeqCst), "fiber entered twice");
                std::hint::spin_loop();
                self.active.store(false, Ordering::SeqCst);
                cx.yield_now();
            }
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_no_double_scheduling() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(4);
        let done = Arc::new(AtomicUsize::new(0));

        sched.start(&pool, 4).unwrap();
        for _ in 0..64 {
            sched
                .add_fiber(Exclusive {
                    active: AtomicBool::new(false),
                    rounds: 200,
                    done: Arc::clone(&done),
                })
                .unwrap();
        }

        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert_eq!(done.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_sleep_wakeup_race() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(2);
        let sleeps = Arc::new(AtomicUsize::new(0));

        let id = {
            let sleeps = Arc::clone(&sleeps);
            sched
                .spawn(move |cx| {
                    for _ in 0..500 {
                        cx.sleep();
                        sleeps.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap()
        };

        sched.start(&pool, 2).unwrap();

        let handle = sched.handle();
        let hammer = thread::spawn(move || {
            while handle.contains(id) {
                handle.wakeup(id);
                thread::yield_now();
            }
        });

        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        hammer.join().unwrap();
        assert_eq!(sleeps.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_sleeping_fiber_stays_parked_until_woken() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(2);
        let woke = Arc::new(AtomicBool::new(false));

        let id = {
            let woke = Arc::clone(&woke);
            sched
                .spawn(move |cx| {
                    cx.sleep();
                    woke.store(true, Ordering::SeqCst);
                })
                .unwrap()
        };
        sched.start(&pool, 1).unwrap();

        wait_until(|| sched.stats().sleeping == 1);
        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));
        assert!(!sched.wait_for_all_fibers_to_exit_timeout(Duration::from_millis(20), false));

        sched.wakeup(id);
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert!(woke.load(Ordering::SeqCst));
    }

    struct Restless {
        sleeps: AtomicUsize,
    }

    impl Fiber for Restless {
        fn run(&self, cx: &FiberHandle<'_>) {
            for _ in 0..5 {
                cx.sleep();
                self.sleeps.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn can_sleep(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_can_sleep_false_keeps_fiber_runnable() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(1);
        let fiber = Arc::new(Restless {
            sleeps: AtomicUsize::new(0),
        });

        sched.add_fiber_arc(fiber.clone()).unwrap();
        sched.start(&pool, 1).unwrap();

        // Never woken, yet it finishes
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert_eq!(fiber.sleeps.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_blocked_stack_starts_after_reclaim() {
        let sched = scheduler(SchedulerConfig::new().max_stacks(Some(1)));
        let pool = ThreadPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            sched
                .spawn(move |cx| {
                    for _ in 0..20 {
                        cx.yield_now();
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        sched.start(&pool, 1).unwrap();
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert_eq!(finished.load(Ordering::SeqCst), 3);

        // One failed attempt per blocked fiber, not one per pass
        let stats = sched.stats();
        assert!(stats.stack_failures >= 1);
        assert!(stats.stack_failures <= 3, "failures = {}", stats.stack_failures);
        assert_eq!(stats.live_stacks, 0);
    }

    #[test]
    fn test_identity_wraparound_skips_live_fibers() {
        let sched = scheduler(SchedulerConfig::new().max_fiber_id(3));
        let pool = ThreadPool::new(1);

        let a = sched.spawn(|cx| cx.sleep()).unwrap();
        let b = sched.spawn(|_cx| {}).unwrap();
        let c = sched.spawn(|cx| cx.sleep()).unwrap();
        assert_eq!((a.as_u32(), b.as_u32(), c.as_u32()), (1, 2, 3));
        assert_eq!(sched.spawn(|_cx| {}), Err(FiberError::IdsExhausted));

        sched.start(&pool, 1).unwrap();
        wait_until(|| {
            let stats = sched.stats();
            stats.sleeping == 2 && stats.fibers == 2
        });

        // Only identity 2 is free
        let d = sched.spawn(|_cx| {}).unwrap();
        assert_eq!(d, b);

        sched.wakeup(a);
        sched.wakeup(c);
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
    }

    #[test]
    fn test_panicking_fiber_is_reclaimed() {
        let sched = scheduler(SchedulerConfig::new().stack_size(256 * 1024));
        let pool = ThreadPool::new(1);
        let survivors = Arc::new(AtomicUsize::new(0));

        sched.spawn(|_cx| panic!("fiber failure")).unwrap();
        for _ in 0..3 {
            let survivors = Arc::clone(&survivors);
            sched
                .spawn(move |cx| {
                    cx.yield_now();
                    survivors.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        sched.start(&pool, 1).unwrap();
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert_eq!(survivors.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_child_fibers_from_fiber() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(2);
        let children = Arc::new(AtomicUsize::new(0));

        {
            let children = Arc::clone(&children);
            sched
                .spawn(move |cx| {
                    let handle = cx.scheduler().expect("scheduler alive");
                    for _ in 0..5 {
                        let children = Arc::clone(&children);
                        handle
                            .spawn(move |_cx| {
                                children.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
                .unwrap();
        }

        sched.start(&pool, 2).unwrap();
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
        assert_eq!(children.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_restart_resumes_fibers() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(4);
        let release = Arc::new(AtomicBool::new(false));
        let spins = Arc::new(AtomicUsize::new(0));

        {
            let release = Arc::clone(&release);
            let spins = Arc::clone(&spins);
            sched
                .spawn(move |cx| {
                    while !release.load(Ordering::SeqCst) {
                        spins.fetch_add(1, Ordering::SeqCst);
                        cx.yield_now();
                    }
                })
                .unwrap();
        }

        sched.start(&pool, 1).unwrap();
        assert_eq!(sched.start(&pool, 1), Err(FiberError::AlreadyRunning));
        wait_until(|| spins.load(Ordering::SeqCst) > 0);

        sched.stop();
        assert!(!sched.is_running());
        let frozen = spins.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(spins.load(Ordering::SeqCst), frozen);
        assert_eq!(sched.fiber_count(), 1);

        release.store(true, Ordering::SeqCst);
        sched.start(&pool, 1).unwrap();
        assert!(sched.wait_for_all_fibers_to_exit_timeout(WAIT, true));
    }

    #[test]
    fn test_stop_interrupts_waiter() {
        let sched = Arc::new(scheduler(SchedulerConfig::new()));
        let pool = ThreadPool::new(1);
        sched.spawn(|cx| cx.sleep()).unwrap();
        sched.start(&pool, 1).unwrap();

        let waiter = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || sched.wait_for_all_fibers_to_exit(false))
        };

        wait_until(|| sched.stats().sleeping == 1);
        thread::sleep(Duration::from_millis(20));
        sched.stop();

        // Repeat in case the waiter had not started waiting yet
        while !waiter.is_finished() {
            thread::sleep(Duration::from_millis(5));
            sched.stop();
        }
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_empty_scheduler_drains_immediately() {
        let sched = scheduler(SchedulerConfig::new());
        assert!(sched.wait_for_all_fibers_to_exit(false));
    }

    #[test]
    fn test_start_validates_worker_count() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(1);
        assert!(matches!(sched.start(&pool, 0), Err(FiberError::InvalidConfig(_))));
        assert!(matches!(sched.start(&pool, 65), Err(FiberError::InvalidConfig(_))));
    }

    #[test]
    fn test_pool_refusal_rolls_back() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(1);
        assert_eq!(sched.start(&pool, 2), Err(FiberError::PoolExhausted));
        assert!(!sched.is_running());
    }

    #[test]
    fn test_drop_frees_suspended_fibers() {
        let sched = scheduler(SchedulerConfig::new());
        let pool = ThreadPool::new(1);
        let handle = sched.handle();

        sched.spawn(|cx| cx.sleep()).unwrap();
        sched.start(&pool, 1).unwrap();
        wait_until(|| sched.stats().sleeping == 1);

        drop(sched);
        assert_eq!(handle.fiber_count(), 0);
        assert_eq!(handle.spawn(|_cx| {}), Err(FiberError::SchedulerGone));
    }
}
