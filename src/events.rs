//! Typed event tables (§9 "Event emitters → typed event tables").
//!
//! Every component with an event stream (`ProcessManager`, `ProcessHandle`,
//! `HeartbeatManager`, `ReconnectManager`, `ShutdownManager`) publishes through one
//! of these instead of an ad-hoc string-keyed emitter. Subscribers get an
//! `unsubscribe` for free: dropping the receiver stops delivery.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// A broadcast-backed event bus for one component's typed event enum.
///
/// Lagging subscribers (slower than the publish rate) miss the oldest
/// unconsumed events rather than stalling the publisher — appropriate for
/// lifecycle/diagnostic events where "most recent state" matters more than a
/// perfect history.
pub struct EventBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers. Returns the number of
    /// subscribers it was delivered to (0 if none are listening).
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to future events. Dropping the returned receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
