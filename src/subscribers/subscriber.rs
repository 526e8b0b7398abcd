//! # Event subscriber trait.
//!
//! [`Subscribe`] is the hook for plugging custom event handlers into the
//! runtime. Each subscriber gets a dedicated worker task and a bounded
//! queue, so a slow or panicking subscriber only affects itself.
//!
//! ## Rules
//! - `on_event()` runs on the subscriber's own worker, never in the
//!   publisher's context.
//! - Events arrive in publish order (per-subscriber FIFO).
//! - Queue overflow drops the event for this subscriber only and is
//!   reported via a `SubscriberOverflow` event.
//! - Panics are caught and reported as `SubscriberPanicked`.

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for runtime observability.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    ///
    /// Handle errors internally; do not panic. Slow processing only backs
    /// up this subscriber's own queue.
    async fn on_event(&self, event: &Event);

    /// Returns the subscriber name used in overflow/panic diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns the preferred queue capacity for this subscriber.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
