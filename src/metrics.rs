//! # Process-wide metrics registry.
//!
//! [`MetricsRegistry`] keeps counters, gauges and timers behind lock-free
//! maps so every subsystem can record without coordination. Entries are
//! keyed by name plus an optional rendered label set, e.g.
//! `worker_exits{worker=reader,exit_code=1}`.
//!
//! ## Rules
//! - Updates are atomic per entry; readers never block writers.
//! - [`MetricsRegistry::snapshot`] returns a serializable, sorted view
//!   used for heartbeat bodies and the final shutdown report.
//! - Gauges store `f64` bits in an `AtomicU64` (single-writer semantics
//!   per gauge are assumed, which holds for the sampler/watchdog loops).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// Accumulated duration observations for one timer entry.
#[derive(Default)]
struct TimerCell {
    count: AtomicU64,
    total_micros: AtomicU64,
}

#[derive(Default)]
struct Inner {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>,
    timers: DashMap<String, TimerCell>,
}

/// Shared handle to the process-wide metrics registry.
///
/// Cloning is cheap; all clones observe the same entries.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

/// Summary of one timer entry in a [`MetricsSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct TimerStats {
    /// Number of observations recorded.
    pub count: u64,
    /// Mean observation in milliseconds (0.0 when empty).
    pub mean_ms: f64,
}

/// Point-in-time serializable view of every metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Counter values, sorted by key.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values, sorted by key.
    pub gauges: BTreeMap<String, f64>,
    /// Timer summaries, sorted by key.
    pub timers: BTreeMap<String, TimerStats>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Adds `delta` to a counter.
    pub fn add(&self, name: &str, delta: u64) {
        self.inner
            .counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Increments a labelled counter by one.
    pub fn incr_with(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(&render_key(name, labels), 1);
    }

    /// Sets a gauge to `value`.
    pub fn gauge(&self, name: &str, value: f64) {
        self.inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .store(value.to_bits(), Ordering::Relaxed);
    }

    /// Records one duration observation for a timer.
    pub fn observe(&self, name: &str, elapsed: Duration) {
        let cell = self.inner.timers.entry(name.to_string()).or_default();
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.total_micros
            .fetch_add(elapsed.as_micros().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    /// Returns the current value of a counter (0 when absent).
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Returns the current value of a labelled counter (0 when absent).
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counter(&render_key(name, labels))
    }

    /// Returns a sorted, serializable view of every entry.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .inner
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .inner
            .gauges
            .iter()
            .map(|e| (e.key().clone(), f64::from_bits(e.value().load(Ordering::Relaxed))))
            .collect();
        let timers = self
            .inner
            .timers
            .iter()
            .map(|e| {
                let count = e.value().count.load(Ordering::Relaxed);
                let total = e.value().total_micros.load(Ordering::Relaxed);
                let mean_ms = if count == 0 {
                    0.0
                } else {
                    (total as f64 / count as f64) / 1000.0
                };
                (e.key().clone(), TimerStats { count, mean_ms })
            })
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            timers,
        }
    }
}

/// Renders `name{k1=v1,k2=v2}`. Label order is the caller's order.
fn render_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut key = String::with_capacity(name.len() + labels.len() * 16);
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key.push('}');
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsRegistry::new();
        m.incr("sent");
        m.add("sent", 2);
        assert_eq!(m.counter("sent"), 3);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn labels_render_deterministically() {
        let m = MetricsRegistry::new();
        m.incr_with("worker_exits", &[("worker", "reader"), ("exit_code", "1")]);
        m.incr_with("worker_exits", &[("worker", "reader"), ("exit_code", "1")]);
        assert_eq!(
            m.counter_with("worker_exits", &[("worker", "reader"), ("exit_code", "1")]),
            2
        );
        let snap = m.snapshot();
        assert!(snap
            .counters
            .contains_key("worker_exits{worker=reader,exit_code=1}"));
    }

    #[test]
    fn gauges_overwrite() {
        let m = MetricsRegistry::new();
        m.gauge("host.cpu_pct", 12.5);
        m.gauge("host.cpu_pct", 80.0);
        let snap = m.snapshot();
        assert_eq!(snap.gauges["host.cpu_pct"], 80.0);
    }

    #[test]
    fn timers_report_mean() {
        let m = MetricsRegistry::new();
        m.observe("post", Duration::from_millis(10));
        m.observe("post", Duration::from_millis(30));
        let snap = m.snapshot();
        let t = &snap.timers["post"];
        assert_eq!(t.count, 2);
        assert!((t.mean_ms - 20.0).abs() < 0.5);
    }
}
