//! Fiber mailboxes

use cofiber_core::FiberId;
use cofiber_runtime::FiberWaker;

use serde_json::Value;

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

/// Message payload
pub type Message = Value;

/// Incoming message buffer of one fiber
///
/// Producers on any thread append under the mailbox's own lock; the owning
/// fiber swaps the whole buffer out in one step. Once the mailbox is bound
/// to its fiber, every append also wakes it. Messages added before binding
/// are kept and seen on the fiber's first drain.
#[derive(Debug, Default)]
pub struct Mailbox {
    owner: OnceLock<FiberWaker>,
    incoming: Mutex<VecDeque<Message>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of the owning fiber, once bound
    pub fn id(&self) -> Option<FiberId> {
        self.owner.get().map(FiberWaker::id)
    }

    /// Bind to the fiber that drains this mailbox (first bind wins)
    pub fn bind(&self, waker: FiberWaker) {
        if self.owner.set(waker).is_err() {
            tracing::warn!(fiber = ?self.id(), "mailbox already bound");
        }
    }

    /// Append a message and wake the owner
    ///
    /// The wake happens after the mailbox lock is released, so the
    /// scheduler lock is never taken while holding it.
    pub fn add_message(&self, msg: Message) {
        self.lock().push_back(msg);
        if let Some(waker) = self.owner.get() {
            waker.wake();
        }
    }

    /// Exchange the incoming buffer with `batch`
    ///
    /// `batch` should be empty; whatever it holds becomes the new incoming
    /// buffer.
    pub fn swap_into(&self, batch: &mut VecDeque<Message>) {
        std::mem::swap(&mut *self.lock(), batch);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.incoming.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_swap_keeps_order() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            mailbox.add_message(json!(i));
        }
        assert_eq!(mailbox.len(), 5);

        let mut batch = VecDeque::new();
        mailbox.swap_into(&mut batch);
        assert!(mailbox.is_empty());
        assert_eq!(batch, (0..5).map(|i| json!(i)).collect::<VecDeque<_>>());
    }

    #[test]
    fn test_unbound_mailbox_buffers() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.id(), None);
        mailbox.add_message(json!("early"));
        assert_eq!(mailbox.len(), 1);
    }
}
