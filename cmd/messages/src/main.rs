//! Message passing example
//!
//! A ring of mailbox fibers passes a token around; each hop decrements it
//! until it reaches zero, then every fiber is told to quit.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - Log filter
//! - `RING_SIZE` - Fibers in the ring (default 8)
//! - `RING_LAPS` - Laps the token travels (default 100)

use cofiber::{
    env_get, FiberId, FiberResult, Message, MessageContext, MessageHandler, Runtime,
    SchedulerConfig,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// One member of the ring
struct Hop {
    /// Identity of every member, filled in once all are added
    ring: Arc<OnceLock<Vec<FiberId>>>,
    index: usize,
}

impl Hop {
    fn next(&self) -> Option<FiberId> {
        let ring = self.ring.get()?;
        Some(ring[(self.index + 1) % ring.len()])
    }

    fn broadcast_quit(&self, cx: &MessageContext<'_>) {
        if let Some(ring) = self.ring.get() {
            for id in ring {
                cx.send_message(*id, json!("quit"));
            }
        }
    }
}

impl MessageHandler for Hop {
    fn process_messages(&mut self, cx: &MessageContext<'_>, batch: &mut VecDeque<Message>) -> bool {
        for msg in batch.drain(..) {
            if msg == json!("quit") {
                debug!(fiber = %cx.id(), "quit");
                return false;
            }

            let Some(token) = msg.get("token").and_then(|t| t.as_u64()) else {
                continue;
            };
            if token == 0 {
                info!(fiber = %cx.id(), "token expired");
                self.broadcast_quit(cx);
            } else if let Some(next) = self.next() {
                cx.send_message(next, json!({ "token": token - 1 }));
            }
        }
        true
    }
}

// RUST_LOG=info cargo run -p cofiber-messages
fn main() -> FiberResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ring_size = env_get::<usize>("RING_SIZE", 8).max(1);
    let laps: u64 = env_get("RING_LAPS", 100);

    println!("=== cofiber Message Ring ===\n");
    println!("Ring size: {}, laps: {}", ring_size, laps);

    let mut runtime = Runtime::new(SchedulerConfig::from_env())?;
    let ring = Arc::new(OnceLock::new());

    let start = Instant::now();
    runtime.block_on(|rt| -> FiberResult<()> {
        let ids = (0..ring_size)
            .map(|index| {
                rt.spawn_messagable(Hop {
                    ring: Arc::clone(&ring),
                    index,
                })
            })
            .collect::<FiberResult<Vec<_>>>()?;

        let first = ids[0];
        let _ = ring.set(ids);
        rt.send_message(first, json!({ "token": laps * ring_size as u64 }));
        Ok(())
    })??;

    let elapsed = start.elapsed();
    let hops = laps * ring_size as u64;
    println!(
        "\n{} hops in {:?} ({:.0} hops/sec)",
        hops,
        elapsed,
        hops as f64 / elapsed.as_secs_f64()
    );
    println!("\n=== Example Complete ===");
    Ok(())
}
