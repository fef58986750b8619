//! Identity-routed message delivery

use crate::mailbox::{Mailbox, Message};
use crate::messagable::{MessagableFiber, MessageHandler};

use cofiber_core::{FiberId, FiberResult};
use cofiber_runtime::SchedulerHandle;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Directory from fiber identity to mailbox
///
/// Cheap to clone; clones share one directory. Sending to an identity that
/// is not registered (never was, or has already exited) is an ordinary
/// outcome reported as `false`.
#[derive(Debug, Clone, Default)]
pub struct FiberMessageCenter {
    directory: Arc<RwLock<HashMap<FiberId, Arc<Mailbox>>>>,
}

impl FiberMessageCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `msg` to the fiber registered as `id`
    pub fn send_message(&self, id: FiberId, msg: Message) -> bool {
        let directory = self.directory.read().unwrap_or_else(PoisonError::into_inner);
        match directory.get(&id) {
            Some(mailbox) => {
                mailbox.add_message(msg);
                true
            }
            None => {
                tracing::trace!(fiber = %id, "message to unknown fiber dropped");
                false
            }
        }
    }

    /// Register `mailbox` under `id`, replacing any previous entry
    pub fn register_fiber(&self, id: FiberId, mailbox: Arc<Mailbox>) {
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, mailbox);
    }

    /// Remove `id`; returns whether it was registered
    pub fn unregister_fiber(&self, id: FiberId) -> bool {
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.directory.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a messagable fiber running `handler`
    ///
    /// The fiber is registered before this returns, so messages sent right
    /// away are queued for its first drain.
    pub fn add_fiber<H: MessageHandler>(
        &self,
        scheduler: &SchedulerHandle,
        handler: H,
    ) -> FiberResult<FiberId> {
        scheduler.add_fiber(MessagableFiber::new(self.clone(), handler))
    }
}
