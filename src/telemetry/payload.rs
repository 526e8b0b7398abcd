//! # Telemetry wire payload.
//!
//! [`TelemetryPayload`] is the unit shipped to the remote endpoint:
//! `{"id", "timestamp", "kind", "device_id", "body"}` where `body` is an
//! arbitrary JSON object. Timestamps are RFC 3339; ids are UUIDv4 assigned
//! at construction and stable across queue round-trips.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// One telemetry record, serialized verbatim onto the wire and into the
/// persistent queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Unique payload id (UUIDv4), used for dedup on the receiving side.
    pub id: String,
    /// Collection time, RFC 3339.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Event kind, e.g. `heartbeat`, `overheat`, `worker_gave_up`.
    pub kind: String,
    /// Identifier of this gateway.
    pub device_id: String,
    /// Arbitrary key/value body.
    pub body: Value,
}

impl TelemetryPayload {
    /// Creates a payload stamped with a fresh id and the current time.
    pub fn new(device_id: impl Into<String>, kind: impl Into<String>, body: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: OffsetDateTime::now_utc(),
            kind: kind.into(),
            device_id: device_id.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_round_trip_is_identity() {
        let p = TelemetryPayload::new("edge-001", "heartbeat", json!({"cpu_pct": 12.5}));
        let bytes = serde_json::to_vec(&p).unwrap();
        let back: TelemetryPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn wire_shape_has_required_fields() {
        let p = TelemetryPayload::new("edge-001", "overheat", json!({"temp_c": 81.0}));
        let v: Value = serde_json::to_value(&p).unwrap();
        for field in ["id", "timestamp", "kind", "device_id", "body"] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
        assert_eq!(v["kind"], "overheat");
    }

    #[test]
    fn ids_are_unique() {
        let a = TelemetryPayload::new("d", "k", json!({}));
        let b = TelemetryPayload::new("d", "k", json!({}));
        assert_ne!(a.id, b.id);
    }
}
