//! Event subscribers: the extension point for observing the runtime.
//!
//! Built-ins:
//! - [`LogSubscriber`] renders events through `tracing`.
//! - [`TelemetryForwarder`] converts alert-worthy events into telemetry
//!   payloads.

mod forward;
mod log;
mod set;
mod subscriber;

pub use forward::TelemetryForwarder;
pub use log::LogSubscriber;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
