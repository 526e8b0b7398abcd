//! Resilient outbound telemetry: retry, circuit breaker, durable
//! store-and-forward queue, and the background send/flush pipeline.

mod breaker;
mod client;
mod payload;
mod queue;
mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{
    HttpTransport, TelemetryClient, TelemetryHandle, TelemetryStats, Transport, FLUSH_BATCH_SIZE,
};
pub use payload::TelemetryPayload;
pub use queue::{PersistentQueue, QueueEntry};
pub use retry::{Jitter, RetryPolicy};
