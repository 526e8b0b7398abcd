//! # Non-blocking event fan-out to multiple subscribers.
//!
//! [`SubscriberSet`] distributes bus events to every subscriber without
//! blocking the publisher.
//!
//! ## Architecture
//! ```text
//! emit_arc(event)
//!     ├──► [queue 1] ──► worker 1 ──► subscriber1.on_event()
//!     ├──► [queue 2] ──► worker 2 ──► subscriber2.on_event()
//!     └──► [queue N] ──► worker N ──► subscriberN.on_event()
//! ```
//!
//! ## Rules
//! - `emit_arc()` uses `try_send` and returns immediately.
//! - Overflow drops the event for that subscriber only and publishes
//!   `SubscriberOverflow` (unless the event is itself a diagnostic).
//! - Worker tasks isolate panics with `catch_unwind` and publish
//!   `SubscriberPanicked`; the worker keeps processing.
//! - No cross-subscriber ordering; per-subscriber delivery is FIFO.

use std::sync::Arc;

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::events::{Bus, Event};

use super::Subscribe;

/// Per-subscriber channel metadata.
struct Channel {
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
}

/// Fan-out coordinator for event subscribers.
pub struct SubscriberSet {
    channels: Vec<Channel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Creates the set and spawns one worker task per subscriber.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<Event>>(sub.queue_capacity().max(1));
            let diag_bus = bus.clone();

            let handle = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = sub.on_event(ev.as_ref());
                    if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        diag_bus.publish(Event::subscriber_panicked(
                            sub.name(),
                            panic_message(&panic),
                        ));
                    }
                }
            });

            channels.push(Channel { name, sender: tx });
            workers.push(handle);
        }

        Self {
            channels,
            workers,
            bus,
        }
    }

    /// Emits a pre-allocated `Arc<Event>` to all subscribers (non-blocking).
    pub fn emit_arc(&self, event: Arc<Event>) {
        let is_diagnostic = event.is_subscriber_diagnostic();

        for ch in &self.channels {
            match ch.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !is_diagnostic {
                        self.bus.publish(Event::subscriber_overflow(ch.name, "full"));
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if !is_diagnostic {
                        self.bus
                            .publish(Event::subscriber_overflow(ch.name, "closed"));
                    }
                }
            }
        }
    }

    /// Spawns the bridge task that pumps bus events into the fan-out.
    ///
    /// Runs until the bus is closed; lagged receivers skip old events.
    pub fn spawn_listener(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit_arc(Arc::new(ev)),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    /// Gracefully shuts down all subscriber workers: closes every queue,
    /// then awaits the workers.
    pub async fn shutdown(self) {
        drop(self.channels);
        for h in self.workers {
            let _ = h.await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
