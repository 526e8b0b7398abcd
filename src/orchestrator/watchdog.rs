//! # Watchdog: dead-worker detection and bounded respawn.
//!
//! A single task wakes every `watchdog_interval` and patrols the
//! registry:
//!
//! ```text
//! per worker:
//!   Running  ─► try_wait
//!               ├─ alive ──► heartbeat file fresh? stale → kill group,
//!               │            reap as a crash on the next tick
//!               └─ exited ─► account restart:
//!                    ├─ uptime ≥ stability_window → streak starts over
//!                    ├─ ceiling exceeded → GaveUp (never auto-retried)
//!                    └─ else → Restarting, respawn after the sweep
//!   Crashed  ─► an earlier spawn failed; same accounting, then retry
//!   Paused   ─► skipped (a stopped child is not dead)
//! ```
//!
//! ## Rules
//! - Probe and spawn errors are logged; the loop never dies.
//! - Respawns happen after the registry lock is released.
//! - `restart_count` never exceeds `max_restarts`, and a worker is
//!   `GaveUp` exactly when the ceiling was hit.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{Event, EventKind};

use super::{worker::WorkerState, ProcessOrchestrator};

/// Outcome of accounting one crash against the restart ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    /// Respawn with the new consecutive count.
    Respawn { restarts: u32 },
    /// Ceiling exceeded; the count clamps at the ceiling.
    GiveUp { restarts: u32 },
}

/// Accounts one crash. `stable` means the worker had been up for the
/// whole stability window, so the previous streak no longer counts.
pub(crate) fn decide_restart(restart_count: u32, max_restarts: u32, stable: bool) -> RestartDecision {
    let streak = if stable { 0 } else { restart_count };
    let candidate = streak + 1;
    if candidate > max_restarts {
        RestartDecision::GiveUp {
            restarts: max_restarts,
        }
    } else {
        RestartDecision::Respawn {
            restarts: candidate,
        }
    }
}

/// Runs the watchdog until cancelled.
pub(crate) async fn watchdog_loop(
    orch: Arc<ProcessOrchestrator>,
    tick: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => orch.patrol().await,
        }
    }
    debug!("watchdog stopped");
}

impl ProcessOrchestrator {
    /// One patrol pass: probe liveness, account crashes, respawn.
    pub(crate) async fn patrol(&self) {
        let max_restarts = self.settings.max_restarts;
        let stability_window = self.settings.stability_window;
        let mut respawns: Vec<String> = Vec::new();

        {
            let mut reg = self.registry.lock().await;
            let mut active = 0u32;
            for name in reg.order.clone() {
                let Some(w) = reg.map.get_mut(&name) else {
                    continue;
                };
                match w.state {
                    WorkerState::Running => {
                        let Some(child) = w.child.as_mut() else {
                            continue;
                        };
                        match child.try_wait() {
                            Ok(None) => {
                                active += 1;
                                if let (Some(max_age), Some(beat), Some(pid)) =
                                    (w.spec.heartbeat_max_age, w.heartbeat_file.as_deref(), w.pid)
                                {
                                    if heartbeat_stale(beat, max_age) {
                                        self.metrics.incr_with(
                                            "worker_zombies",
                                            &[("worker", name.as_str())],
                                        );
                                        self.bus.publish(
                                            Event::now(EventKind::WorkerZombie)
                                                .with_worker(name.clone())
                                                .with_pid(pid),
                                        );
                                        // Kill now; the exit is reaped and
                                        // accounted on the next pass.
                                        let _ = super::signal_group(pid, libc::SIGKILL);
                                    }
                                }
                            }
                            Ok(Some(status)) => {
                                let exit_code = status.code().unwrap_or(-1);
                                w.child = None;
                                w.pid = None;
                                w.last_exit_code = Some(exit_code);
                                let code_label = exit_code.to_string();
                                self.metrics.incr_with(
                                    "worker_exits",
                                    &[
                                        ("worker", name.as_str()),
                                        ("exit_code", code_label.as_str()),
                                    ],
                                );
                                let stable = w
                                    .started_at
                                    .is_some_and(|t| t.elapsed() >= stability_window);
                                match decide_restart(w.restart_count, max_restarts, stable) {
                                    RestartDecision::GiveUp { restarts } => {
                                        w.restart_count = restarts;
                                        w.state = WorkerState::GaveUp;
                                        self.metrics
                                            .incr_with("worker_gave_up", &[("worker", name.as_str())]);
                                        self.bus.publish(
                                            Event::now(EventKind::WorkerGaveUp)
                                                .with_worker(name.clone())
                                                .with_exit_code(exit_code)
                                                .with_restarts(restarts),
                                        );
                                    }
                                    RestartDecision::Respawn { restarts } => {
                                        w.restart_count = restarts;
                                        w.state = WorkerState::Restarting;
                                        self.bus.publish(
                                            Event::now(EventKind::WorkerExited)
                                                .with_worker(name.clone())
                                                .with_exit_code(exit_code)
                                                .with_restarts(restarts),
                                        );
                                        respawns.push(name.clone());
                                    }
                                }
                            }
                            Err(e) => {
                                // Probe errors never kill the watchdog.
                                warn!(worker = %name, error = %e, "liveness probe failed");
                            }
                        }
                    }
                    // A previous spawn attempt failed; each retry counts
                    // against the ceiling like a crash.
                    WorkerState::Crashed => {
                        match decide_restart(w.restart_count, max_restarts, false) {
                            RestartDecision::GiveUp { restarts } => {
                                w.restart_count = restarts;
                                w.state = WorkerState::GaveUp;
                                self.metrics.incr_with("worker_gave_up", &[("worker", name.as_str())]);
                                self.bus.publish(
                                    Event::now(EventKind::WorkerGaveUp)
                                        .with_worker(name.clone())
                                        .with_restarts(restarts),
                                );
                            }
                            RestartDecision::Respawn { restarts } => {
                                w.restart_count = restarts;
                                w.state = WorkerState::Restarting;
                                respawns.push(name.clone());
                            }
                        }
                    }
                    // Paused children are suspended, not dead; Restarting
                    // has a spawn in flight; the rest are not watched.
                    _ => {}
                }
            }
            self.metrics.gauge("workers_active", f64::from(active));
        }

        for name in respawns {
            if let Err(e) = self.launch(&name, &[WorkerState::Restarting], false).await {
                warn!(worker = %name, error = %e, "respawn failed, retrying next tick");
            }
        }
    }
}

/// True when the beat file exists but its mtime is older than `max_age`.
/// A missing file is treated as alive; the next crash or beat settles it.
fn heartbeat_stale(beat: &std::path::Path, max_age: Duration) -> bool {
    match std::fs::metadata(beat).and_then(|m| m.modified()) {
        Ok(modified) => modified
            .elapsed()
            .map(|age| age > max_age)
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_crash_with_zero_ceiling_gives_up() {
        assert_eq!(
            decide_restart(0, 0, false),
            RestartDecision::GiveUp { restarts: 0 }
        );
    }

    #[test]
    fn streak_counts_up_to_ceiling() {
        assert_eq!(
            decide_restart(0, 3, false),
            RestartDecision::Respawn { restarts: 1 }
        );
        assert_eq!(
            decide_restart(2, 3, false),
            RestartDecision::Respawn { restarts: 3 }
        );
        assert_eq!(
            decide_restart(3, 3, false),
            RestartDecision::GiveUp { restarts: 3 }
        );
    }

    #[test]
    fn stability_resets_the_streak() {
        // Even at the ceiling, a long-lived worker starts a new streak.
        assert_eq!(
            decide_restart(3, 3, true),
            RestartDecision::Respawn { restarts: 1 }
        );
    }
}
