//! # edgevisor
//!
//! **Edgevisor** is a self-healing supervisor for Linux edge/IoT
//! gateways. It keeps a fleet of child worker processes alive, quiesces
//! non-essential workers under thermal stress, and ships telemetry with
//! durable store-and-forward across network outages.
//!
//! ## Subsystems
//!
//! | Area              | Description                                                    | Key types                                    |
//! |-------------------|----------------------------------------------------------------|----------------------------------------------|
//! | **Orchestration** | Spawn, watch and restart worker processes with a bounded ceiling; pause/resume via job-control signals. | [`ProcessOrchestrator`], [`WorkerSpec`]      |
//! | **Health**        | Periodic host vitals with hysteretic overheat detection.       | [`HealthMonitor`], [`Sampler`]               |
//! | **Telemetry**     | Retry → circuit breaker → durable queue → background flush.    | [`TelemetryClient`], [`PersistentQueue`]     |
//! | **Events**        | Broadcast bus with isolated subscriber fan-out.                | [`Bus`], [`Event`], [`Subscribe`]            |
//! | **Runtime**       | Root wiring, signal handling, reverse-order shutdown.          | [`Supervisor`], [`Config`]                   |
//!
//! ## Example
//! ```no_run
//! use edgevisor::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::from_env()?;
//!     let supervisor = Supervisor::new(cfg)?;
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod core;
mod error;
mod events;
mod health;
mod metrics;
mod orchestrator;
mod subscribers;
mod telemetry;

// ---- Public re-exports ----

pub use crate::core::Supervisor;
pub use config::Config;
pub use error::{ConfigError, SampleError, StartupError, TelemetryError, WorkerError};
pub use events::{Bus, Event, EventKind};
pub use health::{
    HealthMonitor, HealthSample, Hook, MonitorSettings, Sampler, SysinfoSampler, ThermalHooks,
};
pub use metrics::{MetricsRegistry, MetricsSnapshot, TimerStats};
pub use orchestrator::{
    OrchestratorSettings, PauseReason, ProcessOrchestrator, WorkerSpec, WorkerState, WorkerStatus,
};
pub use subscribers::{LogSubscriber, Subscribe, SubscriberSet, TelemetryForwarder};
pub use telemetry::{
    CircuitBreaker, CircuitState, HttpTransport, Jitter, PersistentQueue, QueueEntry, RetryPolicy,
    TelemetryClient, TelemetryHandle, TelemetryPayload, TelemetryStats, Transport,
    FLUSH_BATCH_SIZE,
};
