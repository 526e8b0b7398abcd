//! # Bus-to-telemetry forwarder.
//!
//! [`TelemetryForwarder`] turns alert-worthy runtime events into telemetry
//! payloads so the fleet backend learns about give-ups, thermal episodes
//! and resource pressure without any subsystem holding a reference to the
//! telemetry client. Routine lifecycle noise (starts, stops, restarts) is
//! deliberately not forwarded; the heartbeat already summarises it.

use async_trait::async_trait;
use serde_json::json;

use crate::events::{Event, EventKind};
use crate::telemetry::{TelemetryHandle, TelemetryPayload};

use super::Subscribe;

/// Converts selected bus events into outbound telemetry.
pub struct TelemetryForwarder {
    handle: TelemetryHandle,
    device_id: String,
}

impl TelemetryForwarder {
    /// Creates a forwarder sending through `handle`, labelled `device_id`.
    pub fn new(handle: TelemetryHandle, device_id: impl Into<String>) -> Self {
        Self {
            handle,
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl Subscribe for TelemetryForwarder {
    async fn on_event(&self, e: &Event) {
        let payload = match e.kind {
            EventKind::WorkerGaveUp => Some(TelemetryPayload::new(
                self.device_id.as_str(),
                "worker_gave_up",
                json!({
                    "worker": e.worker.clone(),
                    "restart_count": e.restarts,
                    "last_exit_code": e.exit_code,
                }),
            )),
            EventKind::Overheat => Some(TelemetryPayload::new(
                self.device_id.as_str(),
                "overheat",
                json!({ "temp_c": e.temp_c }),
            )),
            EventKind::Recovered => Some(TelemetryPayload::new(
                self.device_id.as_str(),
                "recover",
                json!({ "temp_c": e.temp_c }),
            )),
            EventKind::ResourcePressure => Some(TelemetryPayload::new(
                self.device_id.as_str(),
                "resource_pressure",
                json!({ "cpu_pct": e.cpu_pct, "mem_pct": e.mem_pct }),
            )),
            EventKind::WorkerZombie => Some(TelemetryPayload::new(
                self.device_id.as_str(),
                "worker_zombie",
                json!({ "worker": e.worker.clone(), "pid": e.pid }),
            )),
            _ => None,
        };

        if let Some(p) = payload {
            self.handle.send(p);
        }
    }

    fn name(&self) -> &'static str {
        "telemetry-forward"
    }
}
