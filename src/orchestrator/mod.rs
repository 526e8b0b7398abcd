//! # Process orchestrator: lifecycle supervisor for child workers.
//!
//! [`ProcessOrchestrator`] owns the worker registry and every child
//! process handle. Children are spawned detached in their own process
//! group; graceful stop signals the whole group so grandchildren are
//! swept too, then escalates to SIGKILL after the grace period.
//!
//! ## Rules
//! - One mutex guards the registry; critical sections are short and the
//!   spawn syscall happens outside the lock via a reserve/commit pass.
//! - Operations on one worker name are serialised by that lock; no
//!   ordering is promised across workers.
//! - Pause/resume are SIGSTOP/SIGCONT to the child pid and record *why*
//!   the worker was paused, so thermal recovery never resumes a worker an
//!   operator paused by hand.
//! - The watchdog task is the only place restarts happen.

mod watchdog;
mod worker;

pub use worker::{PauseReason, WorkerSpec, WorkerState, WorkerStatus};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::events::{Bus, Event, EventKind};
use crate::metrics::MetricsRegistry;

use worker::Worker;

/// Worker registry: the map plus registration order (pause sweeps honour
/// registration order).
struct Registry {
    map: HashMap<String, Worker>,
    order: Vec<String>,
}

/// Tuning knobs for [`ProcessOrchestrator`].
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Watchdog liveness cadence.
    pub watchdog_interval: Duration,
    /// Per-worker consecutive restart ceiling.
    pub max_restarts: u32,
    /// Continuous uptime after which the consecutive counter resets.
    pub stability_window: Duration,
}

/// Lifecycle supervisor for long-lived child processes.
pub struct ProcessOrchestrator {
    registry: Mutex<Registry>,
    settings: OrchestratorSettings,
    bus: Bus,
    metrics: MetricsRegistry,
    token: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessOrchestrator {
    /// Creates an orchestrator with an empty registry.
    pub fn new(settings: OrchestratorSettings, bus: Bus, metrics: MetricsRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                map: HashMap::new(),
                order: Vec::new(),
            }),
            settings,
            bus,
            metrics,
            token: CancellationToken::new(),
            watchdog: Mutex::new(None),
        })
    }

    /// Registers a worker.
    ///
    /// Re-registering an identical spec is a no-op; any difference is a
    /// `DuplicateName` error.
    pub async fn register(&self, spec: WorkerSpec) -> Result<(), WorkerError> {
        let mut reg = self.registry.lock().await;
        if let Some(existing) = reg.map.get(&spec.name) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(WorkerError::DuplicateName { name: spec.name });
        }
        let name = spec.name.clone();
        reg.order.push(name.clone());
        reg.map.insert(name.clone(), Worker::new(spec));
        self.bus
            .publish(Event::now(EventKind::WorkerRegistered).with_worker(name));
        Ok(())
    }

    /// Starts one worker synchronously.
    ///
    /// Allowed from `Stopped`, `Crashed` and `GaveUp` (an explicit start
    /// is operator intervention, so it clears the restart counter).
    pub async fn start(&self, name: &str) -> Result<(), WorkerError> {
        self.launch(
            name,
            &[WorkerState::Stopped, WorkerState::Crashed, WorkerState::GaveUp],
            true,
        )
        .await
    }

    /// Starts every registered worker currently in `Stopped`.
    pub async fn start_all(&self) -> Vec<(String, Result<(), WorkerError>)> {
        let names: Vec<String> = {
            let reg = self.registry.lock().await;
            reg.order
                .iter()
                .filter(|n| reg.map.get(*n).is_some_and(|w| w.state == WorkerState::Stopped))
                .cloned()
                .collect()
        };

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let res = self.launch(&name, &[WorkerState::Stopped], false).await;
            results.push((name, res));
        }
        results
    }

    /// Spawns the watchdog task. Idempotent.
    pub async fn spawn_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock().await;
        if slot.is_some() {
            return;
        }
        let orch = Arc::clone(self);
        let token = self.token.clone();
        let interval = self.settings.watchdog_interval;
        *slot = Some(tokio::spawn(watchdog::watchdog_loop(orch, interval, token)));
        info!(interval = ?self.settings.watchdog_interval, "watchdog started");
    }

    /// Stops every worker: SIGTERM to each process group, wait up to
    /// `grace`, then SIGKILL the stragglers. No live children remain on
    /// return.
    pub async fn stop_all(&self, grace: Duration) {
        // The watchdog must not respawn what we are tearing down.
        self.token.cancel();
        if let Some(handle) = self.watchdog.lock().await.take() {
            let _ = handle.await;
        }

        {
            let mut reg = self.registry.lock().await;
            for name in reg.order.clone() {
                let Some(w) = reg.map.get_mut(&name) else {
                    continue;
                };
                if let Some(pid) = w.pid {
                    // A stopped child cannot act on SIGTERM.
                    if w.state == WorkerState::Paused {
                        let _ = signal_pid(pid, libc::SIGCONT);
                    }
                    let _ = signal_group(pid, libc::SIGTERM);
                } else if matches!(w.state, WorkerState::Restarting | WorkerState::Crashed) {
                    w.state = WorkerState::Stopped;
                }
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            let mut live = 0usize;
            {
                let mut reg = self.registry.lock().await;
                for name in reg.order.clone() {
                    let Some(w) = reg.map.get_mut(&name) else {
                        continue;
                    };
                    let Some(child) = w.child.as_mut() else {
                        continue;
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            w.last_exit_code = status.code();
                            self.retire(w, WorkerState::Stopped);
                            self.bus.publish(
                                Event::now(EventKind::WorkerStopped)
                                    .with_worker(name.clone())
                                    .with_exit_code(status.code().unwrap_or(-1)),
                            );
                        }
                        Ok(None) => live += 1,
                        Err(e) => {
                            warn!(worker = %name, error = %e, "liveness probe failed during stop");
                            live += 1;
                        }
                    }
                }
            }
            if live == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Escalate: whoever ignored SIGTERM gets the group SIGKILL.
        let mut stragglers: Vec<(String, Child)> = Vec::new();
        {
            let mut reg = self.registry.lock().await;
            for name in reg.order.clone() {
                let Some(w) = reg.map.get_mut(&name) else {
                    continue;
                };
                if let Some(child) = w.child.take() {
                    if let Some(pid) = w.pid {
                        let _ = signal_group(pid, libc::SIGKILL);
                    }
                    self.retire(w, WorkerState::Stopped);
                    stragglers.push((name, child));
                }
            }
        }
        if !stragglers.is_empty() {
            self.metrics.add("worker_kills", stragglers.len() as u64);
            self.bus.publish(
                Event::now(EventKind::StopEscalated).with_count(stragglers.len() as u64),
            );
        }
        for (_, mut child) in stragglers {
            let _ = child.wait().await;
        }

        self.metrics.gauge("workers_active", 0.0);
        info!("all workers stopped");
    }

    /// Pauses a worker through the API (never auto-resumed by recovery).
    pub async fn pause(&self, name: &str) -> Result<(), WorkerError> {
        self.pause_as(name, PauseReason::Api).await
    }

    /// Resumes a paused worker.
    pub async fn resume(&self, name: &str) -> Result<(), WorkerError> {
        let mut reg = self.registry.lock().await;
        let w = reg
            .map
            .get_mut(name)
            .ok_or_else(|| WorkerError::UnknownWorker { name: name.into() })?;
        match w.state {
            // Resuming a running worker is a no-op, not an error.
            WorkerState::Running => Ok(()),
            WorkerState::Paused => {
                // A child killed while suspended is a crash to recover
                // from, not a resume target.
                if let Some(child) = w.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        w.last_exit_code = status.code();
                        self.retire(w, WorkerState::Crashed);
                        return Err(WorkerError::InvalidState {
                            name: name.into(),
                            expected: "paused",
                            actual: "crashed",
                        });
                    }
                }
                let pid = w.pid.ok_or_else(|| WorkerError::InvalidState {
                    name: name.into(),
                    expected: "paused",
                    actual: "paused without pid",
                })?;
                signal_pid(pid, libc::SIGCONT).map_err(|source| WorkerError::Signal {
                    name: name.into(),
                    pid,
                    source,
                })?;
                w.state = WorkerState::Running;
                w.pause_reason = None;
                self.metrics.incr("worker_resumes");
                self.bus.publish(
                    Event::now(EventKind::WorkerResumed)
                        .with_worker(name)
                        .with_pid(pid),
                );
                Ok(())
            }
            other => Err(WorkerError::InvalidState {
                name: name.into(),
                expected: "paused",
                actual: other.as_str(),
            }),
        }
    }

    /// Pauses every non-essential running worker, in registration order.
    ///
    /// Idempotent: already-paused workers are skipped. Returns the names
    /// paused by this sweep. Signal failures are logged and skipped; the
    /// sweep continues.
    pub async fn pause_non_essential(&self) -> Vec<String> {
        let mut paused = Vec::new();
        let mut reg = self.registry.lock().await;
        for name in reg.order.clone() {
            let Some(w) = reg.map.get_mut(&name) else {
                continue;
            };
            if w.spec.essential || w.state != WorkerState::Running {
                continue;
            }
            let Some(pid) = w.pid else { continue };
            match signal_pid(pid, libc::SIGSTOP) {
                Ok(()) => {
                    w.state = WorkerState::Paused;
                    w.pause_reason = Some(PauseReason::Thermal);
                    self.metrics.incr("worker_pauses");
                    self.bus.publish(
                        Event::now(EventKind::WorkerPaused)
                            .with_worker(name.clone())
                            .with_pid(pid),
                    );
                    paused.push(name);
                }
                Err(e) => warn!(worker = %name, pid, error = %e, "thermal pause failed"),
            }
        }
        paused
    }

    /// Resumes every worker paused by thermal self-preservation.
    ///
    /// Workers paused through the API keep their pause.
    pub async fn resume_thermal(&self) -> Vec<String> {
        let mut resumed = Vec::new();
        let mut reg = self.registry.lock().await;
        for name in reg.order.clone() {
            let Some(w) = reg.map.get_mut(&name) else {
                continue;
            };
            if w.state != WorkerState::Paused || w.pause_reason != Some(PauseReason::Thermal) {
                continue;
            }
            let Some(pid) = w.pid else { continue };
            match signal_pid(pid, libc::SIGCONT) {
                Ok(()) => {
                    w.state = WorkerState::Running;
                    w.pause_reason = None;
                    self.metrics.incr("worker_resumes");
                    self.bus.publish(
                        Event::now(EventKind::WorkerResumed)
                            .with_worker(name.clone())
                            .with_pid(pid),
                    );
                    resumed.push(name);
                }
                Err(e) => warn!(worker = %name, pid, error = %e, "thermal resume failed"),
            }
        }
        resumed
    }

    /// Non-blocking liveness query. A paused child still exists, so it
    /// counts as alive.
    pub async fn is_alive(&self, name: &str) -> bool {
        let mut reg = self.registry.lock().await;
        let Some(w) = reg.map.get_mut(name) else {
            return false;
        };
        if !matches!(w.state, WorkerState::Running | WorkerState::Paused) {
            return false;
        }
        match w.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Current pid of a worker's child, if one exists.
    pub async fn pid_of(&self, name: &str) -> Option<u32> {
        let reg = self.registry.lock().await;
        reg.map.get(name).and_then(|w| w.pid)
    }

    /// State of a worker, if registered.
    pub async fn state_of(&self, name: &str) -> Option<WorkerState> {
        let reg = self.registry.lock().await;
        reg.map.get(name).map(|w| w.state)
    }

    /// Consecutive restart count of a worker, if registered.
    pub async fn restart_count_of(&self, name: &str) -> Option<u32> {
        let reg = self.registry.lock().await;
        reg.map.get(name).map(|w| w.restart_count)
    }

    /// Serializable snapshot of every worker, in registration order.
    pub async fn status(&self) -> Vec<WorkerStatus> {
        let reg = self.registry.lock().await;
        reg.order
            .iter()
            .filter_map(|n| reg.map.get(n))
            .map(Worker::status)
            .collect()
    }

    // ---------------------------
    // Internals
    // ---------------------------

    async fn pause_as(&self, name: &str, reason: PauseReason) -> Result<(), WorkerError> {
        let mut reg = self.registry.lock().await;
        let w = reg
            .map
            .get_mut(name)
            .ok_or_else(|| WorkerError::UnknownWorker { name: name.into() })?;
        match w.state {
            // Pausing a paused worker is a no-op, not an error.
            WorkerState::Paused => Ok(()),
            WorkerState::Running => {
                let pid = w.pid.ok_or_else(|| WorkerError::InvalidState {
                    name: name.into(),
                    expected: "running",
                    actual: "running without pid",
                })?;
                signal_pid(pid, libc::SIGSTOP).map_err(|source| WorkerError::Signal {
                    name: name.into(),
                    pid,
                    source,
                })?;
                w.state = WorkerState::Paused;
                w.pause_reason = Some(reason);
                self.metrics.incr("worker_pauses");
                self.bus.publish(
                    Event::now(EventKind::WorkerPaused)
                        .with_worker(name)
                        .with_pid(pid),
                );
                Ok(())
            }
            other => Err(WorkerError::InvalidState {
                name: name.into(),
                expected: "running",
                actual: other.as_str(),
            }),
        }
    }

    /// Reserve → spawn → commit. The spawn syscall runs without the
    /// registry lock held.
    pub(crate) async fn launch(
        &self,
        name: &str,
        from: &[WorkerState],
        reset_counter: bool,
    ) -> Result<(), WorkerError> {
        let spec = {
            let mut reg = self.registry.lock().await;
            let w = reg
                .map
                .get_mut(name)
                .ok_or_else(|| WorkerError::UnknownWorker { name: name.into() })?;
            match w.state {
                WorkerState::Running | WorkerState::Paused => {
                    return Err(WorkerError::AlreadyRunning { name: name.into() });
                }
                state if from.contains(&state) => {
                    w.state = WorkerState::Restarting;
                    w.child = None;
                    w.pid = None;
                    if reset_counter {
                        w.restart_count = 0;
                    }
                    w.spec.clone()
                }
                other => {
                    return Err(WorkerError::InvalidState {
                        name: name.into(),
                        expected: "stopped",
                        actual: other.as_str(),
                    });
                }
            }
        };

        let spawned = spawn_child(&spec);

        let mut reg = self.registry.lock().await;
        let w = reg
            .map
            .get_mut(name)
            .ok_or_else(|| WorkerError::UnknownWorker { name: name.into() })?;
        match spawned {
            Ok((child, beat)) => {
                if w.state != WorkerState::Restarting {
                    // Torn down between reserve and commit (stop_all won
                    // the race); do not resurrect the worker.
                    drop(reg);
                    let mut child = child;
                    let _ = child.start_kill();
                    return Ok(());
                }
                let pid = child.id().unwrap_or_default();
                w.child = Some(child);
                w.pid = Some(pid);
                w.state = WorkerState::Running;
                w.started_at = Some(Instant::now());
                w.heartbeat_file = beat;
                let restarts = w.restart_count;
                drop(reg);
                self.metrics.incr_with("worker_starts", &[("worker", name)]);
                self.bus.publish(
                    Event::now(EventKind::WorkerStarted)
                        .with_worker(name)
                        .with_pid(pid)
                        .with_restarts(restarts),
                );
                Ok(())
            }
            Err(source) => {
                w.state = WorkerState::Crashed;
                drop(reg);
                self.metrics.incr_with("worker_spawn_failures", &[("worker", name)]);
                self.bus.publish(
                    Event::now(EventKind::WorkerSpawnFailed)
                        .with_worker(name)
                        .with_error(source.to_string()),
                );
                Err(WorkerError::Spawn {
                    name: name.into(),
                    source,
                })
            }
        }
    }

    /// Clears the child bookkeeping and removes the heartbeat file.
    fn retire(&self, w: &mut Worker, state: WorkerState) {
        w.child = None;
        w.pid = None;
        w.state = state;
        w.pause_reason = None;
        if let Some(beat) = w.heartbeat_file.take() {
            let _ = std::fs::remove_file(beat);
        }
    }

}

/// Spawns a detached child in its own process group, stdio to /dev/null.
/// Workers own their logging; inheriting our pipes would tie their stdout
/// to our lifetime.
fn spawn_child(spec: &WorkerSpec) -> std::io::Result<(Child, Option<PathBuf>)> {
    let (program, args) = spec.command.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty worker command")
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);

    let beat = match spec.heartbeat_max_age {
        Some(_) => {
            let path = std::env::temp_dir().join(format!("edgevisor-{}.beat", spec.name));
            // Fresh file so a previous incarnation's beat cannot mask a
            // newborn zombie.
            let _ = std::fs::remove_file(&path);
            std::fs::File::create(&path)?;
            cmd.env("EDGEVISOR_HEARTBEAT_FILE", &path);
            Some(path)
        }
        None => None,
    };

    let child = cmd.spawn()?;
    Ok((child, beat))
}

/// Sends a signal to a single process.
#[cfg(unix)]
fn signal_pid(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Sends a signal to a whole process group. Children are spawned as group
/// leaders, so the group id equals the child pid.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if unsafe { libc::killpg(pid as libc::pid_t, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> Arc<ProcessOrchestrator> {
        ProcessOrchestrator::new(
            OrchestratorSettings {
                watchdog_interval: Duration::from_millis(50),
                max_restarts: 3,
                stability_window: Duration::from_secs(60),
            },
            Bus::new(64),
            MetricsRegistry::new(),
        )
    }

    fn sleeper(name: &str) -> WorkerSpec {
        WorkerSpec::new(name, vec!["sleep".into(), "3600".into()], false)
    }

    #[tokio::test]
    async fn register_rejects_conflicting_spec() {
        let orch = orchestrator();
        orch.register(sleeper("w")).await.unwrap();
        // Identical re-registration is a no-op.
        orch.register(sleeper("w")).await.unwrap();
        let err = orch
            .register(WorkerSpec::new("w", vec!["sleep".into(), "1".into()], true))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn start_is_alive_stop_all() {
        let orch = orchestrator();
        orch.register(sleeper("w")).await.unwrap();
        orch.start("w").await.unwrap();
        assert!(orch.is_alive("w").await);
        assert!(matches!(
            orch.start("w").await,
            Err(WorkerError::AlreadyRunning { .. })
        ));

        orch.stop_all(Duration::from_secs(2)).await;
        assert!(!orch.is_alive("w").await);
        assert_eq!(orch.state_of("w").await, Some(WorkerState::Stopped));
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let orch = orchestrator();
        orch.register(sleeper("w")).await.unwrap();
        orch.start("w").await.unwrap();

        orch.pause("w").await.unwrap();
        assert_eq!(orch.state_of("w").await, Some(WorkerState::Paused));
        // A stopped child still exists.
        assert!(orch.is_alive("w").await);
        orch.pause("w").await.unwrap();

        orch.resume("w").await.unwrap();
        assert_eq!(orch.state_of("w").await, Some(WorkerState::Running));
        orch.resume("w").await.unwrap();

        orch.stop_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn pause_requires_running_worker() {
        let orch = orchestrator();
        orch.register(sleeper("w")).await.unwrap();
        assert!(matches!(
            orch.pause("w").await,
            Err(WorkerError::InvalidState { .. })
        ));
        assert!(matches!(
            orch.pause("ghost").await,
            Err(WorkerError::UnknownWorker { .. })
        ));
    }

    #[tokio::test]
    async fn thermal_sweep_spares_essential_and_api_paused() {
        let orch = orchestrator();
        orch.register(sleeper("a")).await.unwrap();
        orch.register(WorkerSpec::new(
            "b",
            vec!["sleep".into(), "3600".into()],
            true,
        ))
        .await
        .unwrap();
        orch.register(sleeper("c")).await.unwrap();
        for n in ["a", "b", "c"] {
            orch.start(n).await.unwrap();
        }
        // "c" paused by hand before the thermal episode.
        orch.pause("c").await.unwrap();

        let paused = orch.pause_non_essential().await;
        assert_eq!(paused, vec!["a".to_string()]);
        assert_eq!(orch.state_of("b").await, Some(WorkerState::Running));

        let resumed = orch.resume_thermal().await;
        assert_eq!(resumed, vec!["a".to_string()]);
        // The operator's pause survives thermal recovery.
        assert_eq!(orch.state_of("c").await, Some(WorkerState::Paused));

        orch.stop_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_from_start() {
        let orch = orchestrator();
        orch.register(WorkerSpec::new(
            "bad",
            vec!["/nonexistent/binary/for/sure".into()],
            false,
        ))
        .await
        .unwrap();
        let err = orch.start("bad").await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        assert_eq!(orch.state_of("bad").await, Some(WorkerState::Crashed));
    }
}
