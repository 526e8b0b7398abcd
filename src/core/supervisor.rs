//! # Supervisor: wires the subsystems and owns the daemon lifecycle.
//!
//! Construction order (leaves first): metrics → bus + subscribers →
//! persistent queue → telemetry client → orchestrator → health monitor
//! (handed thermal hooks that call into the orchestrator). `run()` then
//! starts everything, parks on the shutdown signal, and tears down in
//! strict reverse order.
//!
//! ## Architecture
//! ```text
//! Supervisor::run()
//!   ├── register configured workers
//!   ├── TelemetryClient::start()      (send worker + flush loop)
//!   ├── Orchestrator::start_all()     (workers go live)
//!   ├── Orchestrator::spawn_watchdog()
//!   ├── HealthMonitor::start()        (hooks pause/resume workers)
//!   ├── heartbeat task                (periodic status payloads)
//!   └── wait: OS signal  OR  fatal queue fault
//!         └── graceful shutdown:
//!               stop workers (grace → SIGKILL)
//!               → stop health monitor
//!               → final shutdown payload + flush()
//!               → stop telemetry client
//!               → log final metrics snapshot
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StartupError;
use crate::events::{Bus, Event, EventKind};
use crate::health::{HealthMonitor, MonitorSettings, SysinfoSampler, ThermalHooks};
use crate::metrics::MetricsRegistry;
use crate::orchestrator::{OrchestratorSettings, ProcessOrchestrator};
use crate::subscribers::{LogSubscriber, Subscribe, SubscriberSet, TelemetryForwarder};
use crate::telemetry::{
    HttpTransport, Jitter, PersistentQueue, RetryPolicy, TelemetryClient, TelemetryPayload,
};

use super::shutdown;

/// Event bus ring capacity. Generous relative to event volume so slow
/// subscribers lag rather than lose bursts.
const BUS_CAPACITY: usize = 1024;

/// Root of the edgevisor runtime.
pub struct Supervisor {
    cfg: Config,
    metrics: MetricsRegistry,
    bus: Bus,
    orchestrator: Arc<ProcessOrchestrator>,
    health: Arc<HealthMonitor>,
    telemetry: Arc<TelemetryClient>,
    /// Cancelled by the telemetry pipeline on a durability fault.
    fatal: CancellationToken,
    /// Cancelled when shutdown begins; stops the heartbeat task.
    token: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Wires every subsystem. Must be called inside a tokio runtime.
    ///
    /// Nothing is started; workers are registered and launched by
    /// [`Supervisor::run`].
    pub fn new(cfg: Config) -> Result<Self, StartupError> {
        if cfg.telemetry_endpoint.contains("localhost")
            || cfg.telemetry_endpoint.contains("127.0.0.1")
        {
            warn!(
                endpoint = %cfg.telemetry_endpoint,
                "telemetry endpoint is local; payloads will not leave this host"
            );
        }

        let metrics = MetricsRegistry::new();
        let bus = Bus::new(BUS_CAPACITY);
        let fatal = CancellationToken::new();

        let data_dir = prepare_data_dir(&cfg.data_dir)?;
        let queue = Arc::new(PersistentQueue::open(
            &data_dir.join("buffer.db"),
            cfg.queue_max_rows,
        )?);
        // Earlier releases spooled one JSON file per payload; adopt any
        // leftovers into the queue before the flush loop starts.
        queue.import_spill_dir(&data_dir)?;

        let transport = Arc::new(HttpTransport::new(&cfg.telemetry_endpoint)?);
        let retry = RetryPolicy {
            max_attempts: cfg.retry_max_attempts,
            first: cfg.retry_initial_delay,
            max: std::time::Duration::from_secs(30),
            factor: 2.0,
            jitter: Jitter::Equal,
        };
        let telemetry = Arc::new(TelemetryClient::new(
            transport,
            Arc::clone(&queue),
            retry,
            cfg.circuit_failure_threshold,
            cfg.circuit_timeout,
            cfg.flush_interval,
            cfg.send_queue_capacity,
            bus.clone(),
            metrics.clone(),
            fatal.clone(),
        ));

        let orchestrator = ProcessOrchestrator::new(
            OrchestratorSettings {
                watchdog_interval: cfg.watchdog_interval,
                max_restarts: cfg.max_restarts,
                stability_window: cfg.stability_window,
            },
            bus.clone(),
            metrics.clone(),
        );

        let health = Arc::new(HealthMonitor::new(
            MonitorSettings {
                interval: cfg.health_interval,
                temp_threshold: cfg.temp_threshold,
                hysteresis_margin: cfg.hysteresis_margin,
                cpu_threshold: cfg.cpu_threshold,
                memory_threshold: cfg.memory_threshold,
                warn_debounce: cfg.warn_debounce,
            },
            Box::new(SysinfoSampler::new()),
            thermal_hooks(&orchestrator),
            bus.clone(),
            metrics.clone(),
        ));

        let subscribers: Vec<Arc<dyn Subscribe>> = vec![
            Arc::new(LogSubscriber),
            Arc::new(TelemetryForwarder::new(
                telemetry.handle(),
                cfg.device_id.as_str(),
            )),
        ];
        let subs = Arc::new(SubscriberSet::new(subscribers, bus.clone()));
        subs.spawn_listener();

        Ok(Self {
            cfg,
            metrics,
            bus,
            orchestrator,
            health,
            telemetry,
            fatal,
            token: CancellationToken::new(),
            heartbeat: Mutex::new(None),
        })
    }

    /// Runs the daemon until a shutdown signal or fatal fault, then tears
    /// everything down gracefully.
    pub async fn run(&self) -> Result<(), StartupError> {
        for spec in self.cfg.workers_or_demo() {
            self.orchestrator.register(spec).await?;
        }

        self.telemetry.start().await;
        for (name, res) in self.orchestrator.start_all().await {
            match res {
                Ok(()) => info!(worker = %name, "worker launched"),
                // The watchdog keeps retrying a failed spawn, bounded by
                // the restart ceiling.
                Err(e) => error!(worker = %name, error = %e, "worker failed to launch"),
            }
        }
        self.orchestrator.spawn_watchdog().await;
        self.health.start().await;
        self.spawn_heartbeat().await;

        info!(device_id = %self.cfg.device_id, "edgevisor active, awaiting shutdown signal");
        tokio::select! {
            res = shutdown::wait_for_shutdown_signal() => {
                if let Err(e) = res {
                    error!(error = %e, "signal listener failed, shutting down");
                }
                self.bus.publish(Event::now(EventKind::ShutdownRequested));
            }
            _ = self.fatal.cancelled() => {
                error!("telemetry durability lost, shutting down");
                self.bus.publish(
                    Event::now(EventKind::ShutdownRequested).with_error("queue fault"),
                );
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    /// Reverse-order teardown. Idempotent in the sense that a second call
    /// finds everything already stopped.
    async fn graceful_shutdown(&self) {
        info!("graceful shutdown started");
        self.token.cancel();
        if let Some(h) = self.heartbeat.lock().await.take() {
            let _ = h.await;
        }

        self.orchestrator.stop_all(self.cfg.stop_grace).await;
        self.health.stop().await;

        self.telemetry.handle().send(TelemetryPayload::new(
            self.cfg.device_id.as_str(),
            "shutdown",
            json!({ "reason": "graceful_shutdown" }),
        ));
        let attempted = self.telemetry.flush().await;
        info!(attempted, "final telemetry flush");
        self.telemetry.stop().await;

        match serde_json::to_string(&self.metrics.snapshot()) {
            Ok(snapshot) => info!(%snapshot, "final metrics"),
            Err(e) => warn!(error = %e, "metrics snapshot failed to serialize"),
        }
        info!("graceful shutdown complete");
    }

    /// Periodic heartbeat payload: latest vitals, worker states and
    /// telemetry pipeline statistics.
    async fn spawn_heartbeat(&self) {
        let handle = self.telemetry.handle();
        let health = Arc::clone(&self.health);
        let orchestrator = Arc::clone(&self.orchestrator);
        let telemetry = Arc::clone(&self.telemetry);
        let device_id = self.cfg.device_id.clone();
        let cadence = self.cfg.heartbeat_interval;
        let token = self.token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The immediate first tick would race subsystem startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let body = json!({
                    "health": health.latest_sample().await,
                    "workers": orchestrator.status().await,
                    "telemetry": telemetry.stats(),
                });
                handle.send(TelemetryPayload::new(device_id.as_str(), "heartbeat", body));
            }
        });
        *self.heartbeat.lock().await = Some(task);
    }
}

/// Builds the capability record the health monitor drives: pause every
/// non-essential worker on overheat, resume the thermally paused set on
/// recovery. The hooks hold the orchestrator handle; the monitor never
/// does.
fn thermal_hooks(orchestrator: &Arc<ProcessOrchestrator>) -> ThermalHooks {
    let on_overheat = {
        let orch = Arc::clone(orchestrator);
        Arc::new(move || {
            let orch = Arc::clone(&orch);
            async move {
                let paused = orch.pause_non_essential().await;
                if !paused.is_empty() {
                    warn!(?paused, "workers paused for self-preservation");
                }
            }
            .boxed()
        }) as crate::health::Hook
    };
    let on_recover = {
        let orch = Arc::clone(orchestrator);
        Arc::new(move || {
            let orch = Arc::clone(&orch);
            async move {
                let resumed = orch.resume_thermal().await;
                if !resumed.is_empty() {
                    info!(?resumed, "workers resumed after recovery");
                }
            }
            .boxed()
        }) as crate::health::Hook
    };
    ThermalHooks {
        on_overheat,
        on_recover,
    }
}

/// Ensures the state directory exists, falling back to `./data` when the
/// FHS location is not writable (dev machines, CI).
fn prepare_data_dir(configured: &Path) -> Result<PathBuf, StartupError> {
    match std::fs::create_dir_all(configured) {
        Ok(()) => Ok(configured.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let fallback = PathBuf::from("data");
            warn!(
                configured = %configured.display(),
                fallback = %fallback.display(),
                "state dir not writable, using fallback"
            );
            std::fs::create_dir_all(&fallback).map_err(|source| StartupError::StateDir {
                path: fallback.clone(),
                source,
            })?;
            Ok(fallback)
        }
        Err(source) => Err(StartupError::StateDir {
            path: configured.to_path_buf(),
            source,
        }),
    }
}
