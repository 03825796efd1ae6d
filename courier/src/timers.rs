//! Keyed timer registry for the client task.
//!
//! Every timer the client arms is recorded here under a [`TimerKey`], so the
//! whole set can be cancelled in one place on disconnect or shutdown. Timers
//! fire by sending a [`TimerFired`] into the client's event loop; the
//! generation stamp lets the loop discard expirations that raced with a
//! cancel or re-arm.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::delivery::SlotKey;

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Bound on a single open attempt.
    Connect,
    /// Backoff delay before the next reconnect attempt.
    Reconnect,
    /// Next heartbeat probe.
    Heartbeat,
    /// Deadline for the outstanding heartbeat reply.
    HeartbeatTimeout,
    /// Deadline for the acknowledgment of one in-flight message.
    AckTimeout(SlotKey),
}

/// Expiration notice delivered to the client task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// The timer that expired.
    pub key: TimerKey,
    /// Generation the timer was armed with.
    pub generation: u64,
}

struct Armed {
    generation: u64,
    handle: AbortHandle,
}

/// Owns every pending timer of one client.
pub struct TimerRegistry {
    armed: HashMap<TimerKey, Armed>,
    next_generation: u64,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerRegistry {
    /// Create an empty registry and the receiver its expirations arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let registry = Self {
            armed: HashMap::new(),
            next_generation: 0,
            fired_tx,
        };
        (registry, fired_rx)
    }

    /// Arm `key` to fire after `delay`, replacing any timer already armed
    /// under the same key.
    pub fn schedule(&mut self, key: TimerKey, delay: Duration) {
        let generation = self.bump();
        let fired_tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired_tx.send(TimerFired { key, generation });
        });
        self.insert(key, generation, task.abort_handle());
    }

    /// Register an externally spawned task under `key` so it is aborted along
    /// with the timers. Any timer already armed under the key is cancelled.
    pub fn track(&mut self, key: TimerKey, handle: AbortHandle) {
        let generation = self.bump();
        self.insert(key, generation, handle);
    }

    /// Drop the entry for `key` without aborting its task.
    pub fn forget(&mut self, key: TimerKey) {
        self.armed.remove(&key);
    }

    /// Cancel the timer armed under `key`, if any.
    pub fn cancel(&mut self, key: TimerKey) {
        if let Some(armed) = self.armed.remove(&key) {
            armed.handle.abort();
        }
    }

    /// Cancel every armed timer.
    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }

    /// Whether a timer is armed under `key`.
    #[must_use]
    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Whether no timers are armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Accept an expiration notice.
    ///
    /// Returns `true` and disarms the key if the notice belongs to the timer
    /// currently armed under it; stale notices return `false`.
    pub fn fire(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.key) {
            Some(armed) if armed.generation == fired.generation => {
                self.armed.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn insert(&mut self, key: TimerKey, generation: u64, handle: AbortHandle) {
        if let Some(previous) = self.armed.insert(key, Armed { generation, handle }) {
            previous.handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
