//! Worker pool contract
//!
//! The scheduler does not own OS threads. It hands each scheduling loop to a
//! `WorkerPool` as an opaque job and steers it through an `Interrupt` token,
//! so any pool able to run a long-lived closure on its own thread will do.
//! `ThreadPool` is the default: one named OS thread per job.

use cofiber_core::{FiberError, FiberResult};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Unit of work handed to a pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a job on a thread of its own
pub trait WorkerPool: Send + Sync {
    /// Run `job` on a worker thread
    ///
    /// `name` identifies the job (pools that spawn threads use it as the
    /// thread name). The job may run for a long time; the pool must not
    /// run it on the calling thread.
    fn execute(&self, name: &str, job: Job) -> FiberResult<()>;
}

impl<P: WorkerPool + ?Sized> WorkerPool for Arc<P> {
    fn execute(&self, name: &str, job: Job) -> FiberResult<()> {
        (**self).execute(name, job)
    }
}

/// Stop request for one scheduling loop
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Has this loop been asked to stop
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One-shot completion signal
#[derive(Debug, Default)]
pub(crate) struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn release(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Default pool: one named OS thread per job, bounded
pub struct ThreadPool {
    /// Maximum threads alive at once
    max_threads: usize,

    /// Threads spawned so far (for naming)
    spawned: AtomicUsize,

    /// Join handles of threads that may still be alive
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Create a pool allowing at most `max_threads` live threads
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            spawned: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(max_threads)),
        }
    }

    /// Maximum threads alive at once
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Threads that have not finished yet
    pub fn active(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Wait for every thread spawned so far to finish
    ///
    /// Only returns once all jobs have returned, so stop whatever they run
    /// first.
    pub fn join(&self) {
        let handles = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

impl WorkerPool for ThreadPool {
    fn execute(&self, name: &str, job: Job) -> FiberResult<()> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        if handles.len() >= self.max_threads {
            return Err(FiberError::PoolExhausted);
        }

        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let thread_name = if name.is_empty() {
            format!("cofiber-pool-{}", index)
        } else {
            name.to_string()
        };

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(job)
            .map_err(|e| FiberError::Spawn(e.to_string()))?;
        handles.push(handle);
        Ok(())
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("max_threads", &self.max_threads)
            .field("spawned", &self.spawned.load(Ordering::Relaxed))
            .finish()
    }
}
