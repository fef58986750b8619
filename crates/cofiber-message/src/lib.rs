//! # cofiber-message
//!
//! Message passing between fibers.
//!
//! - `Mailbox` - per-fiber incoming buffer with its own lock
//! - `MessagableFiber` - fiber that drains its mailbox through a
//!   `MessageHandler` and sleeps while it is empty
//! - `FiberMessageCenter` - routes messages by fiber identity
//!
//! Payloads are `serde_json::Value`.
//!
//! ```rust,ignore
//! let center = FiberMessageCenter::new();
//! let id = center.add_fiber(&scheduler.handle(), |_cx: &MessageContext<'_>, batch: &mut VecDeque<Message>| {
//!     !batch.iter().any(|m| m == "quit")
//! })?;
//! center.send_message(id, json!("quit"));
//! ```

pub mod center;
pub mod mailbox;
pub mod messagable;

pub use center::FiberMessageCenter;
pub use mailbox::{Mailbox, Message};
pub use messagable::{MessagableFiber, MessageContext, MessageHandler};
