//! FIFO of received ticks, filled by the network loop and drained by the
//! dispatcher.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use lockstep_core::ServerTick;

/// Unbounded multi-producer, multi-consumer tick queue.
#[derive(Clone, Debug)]
pub struct TickQueue {
    tx: Sender<Arc<ServerTick>>,
    rx: Receiver<Arc<ServerTick>>,
}

impl TickQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Appends a tick.
    pub fn push(&self, tick: Arc<ServerTick>) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(tick);
    }

    /// Removes the oldest tick, if any.
    #[must_use]
    pub fn try_pop(&self) -> Option<Arc<ServerTick>> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for a tick.
    #[must_use]
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Arc<ServerTick>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Number of queued ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if no tick is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for TickQueue {
    fn default() -> Self {
        Self::new()
    }
}
