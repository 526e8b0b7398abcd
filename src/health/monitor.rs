//! # Health monitor: periodic vitals sampling with hysteretic thresholds.
//!
//! Every `interval` the monitor takes a [`HealthSample`], publishes host
//! gauges, and evaluates two detectors:
//!
//! - [`ThermalLatch`]: overheat trigger with hysteresis. Crossing
//!   `temp_threshold` fires the overheat hook once; the latch releases
//!   only after the temperature falls to `threshold − margin`, so a
//!   borderline reading cannot flap workers between paused and running.
//! - [`PressureGate`]: CPU/memory warning, debounced to at most one
//!   event per `warn_debounce`.
//!
//! ## Rules
//! - A failed sample is logged, counted and skipped; the loop survives.
//! - Hooks run on the sampler task and are panic-isolated; a misbehaving
//!   hook can never kill the monitor.
//! - An absent temperature reading never fires the overheat predicate.
//! - `start()`/`stop()` are idempotent.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{Bus, Event, EventKind};
use crate::metrics::MetricsRegistry;

use super::sample::{HealthSample, Sampler};

/// Async hook invoked by the monitor.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability record wiring the monitor to the orchestrator without
/// owning it: one hook to quiesce workers, one to wake them back up.
#[derive(Clone)]
pub struct ThermalHooks {
    /// Invoked once when the overheat latch engages.
    pub on_overheat: Hook,
    /// Invoked once when the latch releases.
    pub on_recover: Hook,
}

impl ThermalHooks {
    /// Hooks that do nothing (tests, monitor-only deployments).
    pub fn noop() -> Self {
        Self {
            on_overheat: Arc::new(|| async {}.boxed()),
            on_recover: Arc::new(|| async {}.boxed()),
        }
    }
}

/// Edge produced by the thermal latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThermalEdge {
    Overheat,
    Recovered,
}

/// Overheat latch with hysteresis.
struct ThermalLatch {
    threshold: f64,
    margin: f64,
    overheating: bool,
}

impl ThermalLatch {
    fn new(threshold: f64, margin: f64) -> Self {
        Self {
            threshold,
            margin,
            overheating: false,
        }
    }

    /// Feeds one reading; returns the edge if the latch flipped.
    ///
    /// Trigger is inclusive (`temp >= threshold`); release is strict
    /// (`temp < threshold - margin`), so a reading sitting exactly on the
    /// margin keeps workers quiesced. `None` readings leave the latch
    /// untouched: unknown is not cool.
    fn observe(&mut self, temp_c: Option<f64>) -> Option<ThermalEdge> {
        let temp = temp_c?;
        if !self.overheating && temp >= self.threshold {
            self.overheating = true;
            return Some(ThermalEdge::Overheat);
        }
        if self.overheating && temp < self.threshold - self.margin {
            self.overheating = false;
            return Some(ThermalEdge::Recovered);
        }
        None
    }
}

/// Debounce gate for resource pressure warnings.
struct PressureGate {
    cpu_threshold: f64,
    mem_threshold: f64,
    debounce: Duration,
    last_fired: Option<Instant>,
}

impl PressureGate {
    fn new(cpu_threshold: f64, mem_threshold: f64, debounce: Duration) -> Self {
        Self {
            cpu_threshold,
            mem_threshold,
            debounce,
            last_fired: None,
        }
    }

    /// True when a warning should fire for this sample.
    fn observe(&mut self, cpu_pct: f64, mem_pct: f64, now: Instant) -> bool {
        if cpu_pct <= self.cpu_threshold && mem_pct <= self.mem_threshold {
            return false;
        }
        let quiet = self
            .last_fired
            .map_or(true, |t| now.duration_since(t) >= self.debounce);
        if quiet {
            self.last_fired = Some(now);
        }
        quiet
    }
}

/// Tuning knobs for [`HealthMonitor`].
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    /// Sampling cadence.
    pub interval: Duration,
    /// Overheat trigger, Celsius.
    pub temp_threshold: f64,
    /// Release margin below the trigger, Celsius.
    pub hysteresis_margin: f64,
    /// CPU warning threshold, percent.
    pub cpu_threshold: f64,
    /// Memory warning threshold, percent.
    pub memory_threshold: f64,
    /// Minimum spacing between pressure warnings.
    pub warn_debounce: Duration,
}

/// Periodic vitals sampler with threshold events.
pub struct HealthMonitor {
    settings: MonitorSettings,
    sampler: Mutex<Option<Box<dyn Sampler>>>,
    hooks: ThermalHooks,
    bus: Bus,
    metrics: MetricsRegistry,
    latest: Arc<RwLock<Option<HealthSample>>>,
    overheating: Arc<std::sync::atomic::AtomicBool>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Wires the monitor. Nothing runs until [`HealthMonitor::start`].
    pub fn new(
        settings: MonitorSettings,
        sampler: Box<dyn Sampler>,
        hooks: ThermalHooks,
        bus: Bus,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            settings,
            sampler: Mutex::new(Some(sampler)),
            hooks,
            bus,
            metrics,
            latest: Arc::new(RwLock::new(None)),
            overheating: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawns the sampling loop. Idempotent.
    pub async fn start(&self) {
        let Some(mut sampler) = self.sampler.lock().await.take() else {
            return;
        };

        let settings = self.settings.clone();
        let hooks = self.hooks.clone();
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();
        let latest = Arc::clone(&self.latest);
        let overheating = Arc::clone(&self.overheating);
        let token = self.token.clone();

        let handle = tokio::spawn(async move {
            let mut latch = ThermalLatch::new(settings.temp_threshold, settings.hysteresis_margin);
            let mut gate = PressureGate::new(
                settings.cpu_threshold,
                settings.memory_threshold,
                settings.warn_debounce,
            );
            let mut ticker = interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let sample = match sampler.sample() {
                    Ok(s) => s,
                    Err(e) => {
                        metrics.incr("health.sample_failures");
                        bus.publish(
                            Event::now(EventKind::SampleFailed).with_error(e.to_string()),
                        );
                        continue;
                    }
                };

                metrics.gauge("host.cpu_pct", sample.cpu_pct);
                metrics.gauge("host.mem_pct", sample.mem_pct);
                metrics.gauge("host.disk_pct", sample.disk_pct);
                if let Some(t) = sample.temp_c {
                    metrics.gauge("host.temp_c", t);
                }

                match latch.observe(sample.temp_c) {
                    Some(ThermalEdge::Overheat) => {
                        overheating.store(true, std::sync::atomic::Ordering::Relaxed);
                        metrics.incr("health.overheat_events");
                        warn!(temp_c = sample.temp_c, "overheat threshold crossed");
                        run_hook(&hooks.on_overheat, "on_overheat", &bus).await;
                        bus.publish(
                            Event::now(EventKind::Overheat)
                                .with_temp(sample.temp_c.unwrap_or_default()),
                        );
                    }
                    Some(ThermalEdge::Recovered) => {
                        overheating.store(false, std::sync::atomic::Ordering::Relaxed);
                        metrics.incr("health.recovery_events");
                        info!(temp_c = sample.temp_c, "temperature back under margin");
                        run_hook(&hooks.on_recover, "on_recover", &bus).await;
                        bus.publish(
                            Event::now(EventKind::Recovered)
                                .with_temp(sample.temp_c.unwrap_or_default()),
                        );
                    }
                    None => {}
                }

                if gate.observe(sample.cpu_pct, sample.mem_pct, Instant::now()) {
                    metrics.incr("health.pressure_events");
                    bus.publish(
                        Event::now(EventKind::ResourcePressure)
                            .with_load(sample.cpu_pct, sample.mem_pct),
                    );
                }

                *latest.write().await = Some(sample);
            }
        });

        *self.task.lock().await = Some(handle);
        info!(interval = ?self.settings.interval, temp_threshold = self.settings.temp_threshold, "health monitor started");
    }

    /// Stops the sampling loop. Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if handle.await.is_err() {
                error!("health monitor task panicked during shutdown");
            }
        }
    }

    /// Returns the most recent sample, if any.
    pub async fn latest_sample(&self) -> Option<HealthSample> {
        self.latest.read().await.clone()
    }

    /// True while the overheat latch is engaged.
    pub fn is_overheating(&self) -> bool {
        self.overheating.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Runs a hook with panic isolation: a hook failure must never take the
/// sampling loop down with it.
async fn run_hook(hook: &Hook, label: &'static str, bus: &Bus) {
    let fut = (hook)();
    if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!(hook = label, "thermal hook panicked");
        bus.publish(Event::subscriber_panicked(label, "thermal hook panicked".into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_requires_threshold_to_fire() {
        let mut latch = ThermalLatch::new(75.0, 5.0);
        assert_eq!(latch.observe(Some(74.9)), None);
        assert_eq!(latch.observe(Some(75.0)), Some(ThermalEdge::Overheat));
    }

    #[test]
    fn latch_hysteresis_blocks_flapping() {
        let mut latch = ThermalLatch::new(75.0, 5.0);
        assert_eq!(latch.observe(Some(80.0)), Some(ThermalEdge::Overheat));
        // Back under the trigger but not under the margin: still latched.
        assert_eq!(latch.observe(Some(72.0)), None);
        // Sitting exactly on threshold minus margin does not release yet.
        assert_eq!(latch.observe(Some(70.0)), None);
        assert_eq!(latch.observe(Some(69.9)), Some(ThermalEdge::Recovered));
        // And it does not re-fire until the trigger is crossed again.
        assert_eq!(latch.observe(Some(74.0)), None);
    }

    #[test]
    fn latch_ignores_missing_sensor() {
        let mut latch = ThermalLatch::new(20.0, 5.0);
        assert_eq!(latch.observe(None), None);
        assert_eq!(latch.observe(Some(25.0)), Some(ThermalEdge::Overheat));
        // Sensor disappearing mid-episode keeps the latch engaged.
        assert_eq!(latch.observe(None), None);
        assert_eq!(latch.observe(Some(10.0)), Some(ThermalEdge::Recovered));
    }

    #[test]
    fn pressure_gate_debounces() {
        let mut gate = PressureGate::new(95.0, 90.0, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(gate.observe(99.0, 50.0, t0));
        // Within the debounce window: suppressed.
        assert!(!gate.observe(99.0, 50.0, t0 + Duration::from_secs(30)));
        // After the window: fires again.
        assert!(gate.observe(50.0, 95.0, t0 + Duration::from_secs(61)));
        // Below both thresholds: never fires.
        assert!(!gate.observe(10.0, 10.0, t0 + Duration::from_secs(200)));
    }

    #[tokio::test]
    async fn monitor_drives_hooks_from_scripted_samples() {
        use crate::error::SampleError;
        use crate::health::sample::{HealthSample, Sampler};
        use std::sync::atomic::{AtomicU32, Ordering};
        use time::OffsetDateTime;

        struct ScriptedSampler {
            temps: Vec<Option<f64>>,
            next: usize,
        }

        impl Sampler for ScriptedSampler {
            fn sample(&mut self) -> Result<HealthSample, SampleError> {
                let temp = self.temps[self.next.min(self.temps.len() - 1)];
                self.next += 1;
                Ok(HealthSample {
                    cpu_pct: 10.0,
                    mem_pct: 10.0,
                    disk_pct: 10.0,
                    temp_c: temp,
                    at: OffsetDateTime::now_utc(),
                })
            }
        }

        let paused = Arc::new(AtomicU32::new(0));
        let resumed = Arc::new(AtomicU32::new(0));
        let hooks = ThermalHooks {
            on_overheat: {
                let paused = Arc::clone(&paused);
                Arc::new(move || {
                    let paused = Arc::clone(&paused);
                    async move {
                        paused.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                })
            },
            on_recover: {
                let resumed = Arc::clone(&resumed);
                Arc::new(move || {
                    let resumed = Arc::clone(&resumed);
                    async move {
                        resumed.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                })
            },
        };

        let monitor = HealthMonitor::new(
            MonitorSettings {
                interval: Duration::from_millis(10),
                temp_threshold: 20.0,
                hysteresis_margin: 5.0,
                cpu_threshold: 95.0,
                memory_threshold: 90.0,
                warn_debounce: Duration::from_secs(60),
            },
            Box::new(ScriptedSampler {
                temps: vec![Some(25.0), Some(25.0), Some(10.0), Some(10.0)],
                next: 0,
            }),
            hooks,
            Bus::new(64),
            MetricsRegistry::new(),
        );

        monitor.start().await;
        // Poll rather than sleep a fixed time: the loop needs a few ticks.
        for _ in 0..200 {
            if resumed.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        monitor.stop().await;

        assert_eq!(paused.load(Ordering::SeqCst), 1);
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_overheating());
        assert!(monitor.latest_sample().await.is_some());
    }
}
