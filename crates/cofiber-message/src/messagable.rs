//! Fibers driven by their mailbox
//!
//! A `MessagableFiber` loops: swap the incoming buffer out, hand the batch
//! to its `MessageHandler`, then sleep if nothing new arrived meanwhile or
//! yield if something did. `can_sleep` refuses to park it while the mailbox
//! is non-empty, so a message racing with the sleep is never stranded.

use crate::center::FiberMessageCenter;
use crate::mailbox::{Mailbox, Message};

use cofiber_core::FiberId;
use cofiber_runtime::{Fiber, FiberHandle, FiberWaker, SchedulerHandle};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// What a `MessageContext` gives a handler
pub struct MessageContext<'a> {
    fiber: &'a FiberHandle<'a>,
    center: &'a FiberMessageCenter,
}

impl<'a> MessageContext<'a> {
    /// Identity of the fiber processing messages
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Send to another fiber through the same center
    pub fn send_message(&self, id: FiberId, msg: Message) -> bool {
        self.center.send_message(id, msg)
    }

    pub fn center(&self) -> &FiberMessageCenter {
        self.center
    }

    /// Owning scheduler, for starting child fibers
    pub fn scheduler(&self) -> Option<SchedulerHandle> {
        self.fiber.scheduler()
    }
}

/// Message processing logic of a `MessagableFiber`
///
/// Handlers never suspend the fiber themselves; the surrounding loop does
/// that between batches.
pub trait MessageHandler: Send + 'static {
    /// Called once when the fiber first runs, before any batch
    fn on_start(&mut self, _cx: &MessageContext<'_>) {}

    /// Process one batch in arrival order; return false to exit
    ///
    /// Whatever is left in `batch` afterwards is discarded.
    fn process_messages(&mut self, cx: &MessageContext<'_>, batch: &mut VecDeque<Message>) -> bool;
}

impl<F> MessageHandler for F
where
    F: FnMut(&MessageContext<'_>, &mut VecDeque<Message>) -> bool + Send + 'static,
{
    fn process_messages(&mut self, cx: &MessageContext<'_>, batch: &mut VecDeque<Message>) -> bool {
        self(cx, batch)
    }
}

/// Fiber with a mailbox
pub struct MessagableFiber<H> {
    center: FiberMessageCenter,
    mailbox: Arc<Mailbox>,
    handler: Mutex<H>,
    stack_size: usize,
}

impl<H: MessageHandler> MessagableFiber<H> {
    pub fn new(center: FiberMessageCenter, handler: H) -> Self {
        Self {
            center,
            mailbox: Arc::new(Mailbox::new()),
            handler: Mutex::new(handler),
            stack_size: 0,
        }
    }

    /// Request a specific stack size (0 = scheduler default)
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// This fiber's mailbox
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// Queue a message for this fiber directly
    pub fn add_message(&self, msg: Message) {
        self.mailbox.add_message(msg);
    }

    fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut handler)
    }
}

/// Removes the fiber from its center however `run` ends, unwinding included
struct Registration<'a> {
    center: &'a FiberMessageCenter,
    id: FiberId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.center.unregister_fiber(self.id);
    }
}

impl<H: MessageHandler> Fiber for MessagableFiber<H> {
    fn run(&self, cx: &FiberHandle<'_>) {
        let id = cx.id();
        self.center.register_fiber(id, Arc::clone(&self.mailbox));
        let _registration = Registration {
            center: &self.center,
            id,
        };

        let mcx = MessageContext {
            fiber: cx,
            center: &self.center,
        };
        self.with_handler(|h| h.on_start(&mcx));

        let mut batch = VecDeque::new();
        loop {
            self.mailbox.swap_into(&mut batch);
            let keep_running = self.with_handler(|h| h.process_messages(&mcx, &mut batch));
            batch.clear();
            if !keep_running {
                break;
            }

            if self.mailbox.is_empty() {
                cx.sleep();
            } else {
                cx.yield_now();
            }
        }

        tracing::debug!(fiber = %id, "messagable fiber finished");
    }

    fn can_sleep(&self) -> bool {
        self.mailbox.is_empty()
    }

    fn stack_size(&self) -> usize {
        self.stack_size
    }

    fn attach(&self, id: FiberId, waker: FiberWaker) {
        self.mailbox.bind(waker);
        self.center.register_fiber(id, Arc::clone(&self.mailbox));
    }
}
