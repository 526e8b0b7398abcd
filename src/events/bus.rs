//! # Event bus for broadcasting runtime events.
//!
//! [`Bus`] wraps a [`tokio::sync::broadcast`] channel so the orchestrator,
//! health monitor and telemetry pipeline can broadcast [`Event`]s to any
//! number of subscribers.
//!
//! - **Broadcast semantics**: every active subscriber receives a clone of
//!   each event.
//! - **Non-persistent**: events published with no subscribers are dropped.
//! - **Bounded**: slow subscribers that lag past the ring capacity observe
//!   `Lagged` and skip old events.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given ring capacity (clamped to >= 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all active subscribers.
    ///
    /// Dropping the event when nobody listens is intentional: the runtime
    /// operates the same with or without observers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a new receiver that observes all events published after
    /// this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
