//! # Structured-log subscriber.
//!
//! [`LogSubscriber`] renders runtime events through `tracing` so operators
//! see one consistent record stream regardless of which subsystem emitted
//! the event. Severity follows the event's operational weight: restarts
//! and pressure warn, give-ups and faults error, routine lifecycle is info.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};

use super::Subscribe;

/// Renders every runtime event as a structured log record.
pub struct LogSubscriber;

#[async_trait]
impl Subscribe for LogSubscriber {
    async fn on_event(&self, e: &Event) {
        let worker = e.worker.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::WorkerRegistered => {
                info!(worker, "worker registered");
            }
            EventKind::WorkerStarted => {
                info!(worker, pid = e.pid, restarts = e.restarts, "worker started");
            }
            EventKind::WorkerExited => {
                warn!(
                    worker,
                    exit_code = e.exit_code,
                    restarts = e.restarts,
                    "worker exited, scheduling restart"
                );
            }
            EventKind::WorkerSpawnFailed => {
                warn!(worker, error = e.error.as_deref(), "worker spawn failed");
            }
            EventKind::WorkerGaveUp => {
                error!(
                    worker,
                    restarts = e.restarts,
                    "worker reached restart ceiling, giving up"
                );
            }
            EventKind::WorkerPaused => {
                info!(worker, pid = e.pid, "worker paused");
            }
            EventKind::WorkerResumed => {
                info!(worker, pid = e.pid, "worker resumed");
            }
            EventKind::WorkerStopped => {
                info!(worker, exit_code = e.exit_code, "worker stopped");
            }
            EventKind::WorkerZombie => {
                error!(worker, pid = e.pid, "worker heartbeat stale, killing");
            }
            EventKind::StopEscalated => {
                warn!(count = e.count, "grace period expired, killing remaining children");
            }
            EventKind::Overheat => {
                warn!(temp_c = e.temp_c, "overheat detected, pausing non-essential workers");
            }
            EventKind::Recovered => {
                info!(temp_c = e.temp_c, "temperature recovered, resuming workers");
            }
            EventKind::ResourcePressure => {
                warn!(cpu_pct = e.cpu_pct, mem_pct = e.mem_pct, "resource pressure");
            }
            EventKind::SampleFailed => {
                warn!(error = e.error.as_deref(), "health sample failed");
            }
            EventKind::TelemetrySpilled => {
                warn!(error = e.error.as_deref(), "telemetry spilled to queue");
            }
            EventKind::TelemetryFlushed => {
                info!(count = e.count, "telemetry flushed from queue");
            }
            EventKind::CircuitOpened => {
                warn!("telemetry circuit opened");
            }
            EventKind::CircuitClosed => {
                info!("telemetry circuit closed");
            }
            EventKind::QueueFault => {
                error!(error = e.error.as_deref(), "persistent queue fault");
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = worker, error = e.error.as_deref(), "subscriber panicked");
            }
            EventKind::SubscriberOverflow => {
                debug!(error = e.error.as_deref(), "subscriber dropped an event");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
