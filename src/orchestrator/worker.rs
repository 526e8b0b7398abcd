//! # Worker records.
//!
//! [`WorkerSpec`] is what callers register; [`Worker`] is the
//! orchestrator's private bookkeeping around the live child process.
//! [`WorkerStatus`] is the serializable view embedded in heartbeats.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::time::Instant;

/// Liveness state of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Registered but not started, or deliberately stopped.
    Stopped,
    /// A live child process exists.
    Running,
    /// The child was suspended with the job-control stop signal.
    Paused,
    /// The last child exited (or failed to spawn); awaiting the watchdog.
    Crashed,
    /// A respawn was scheduled and is in flight.
    Restarting,
    /// The restart ceiling was reached; never retried automatically.
    GaveUp,
}

impl WorkerState {
    /// Short stable name for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Crashed => "crashed",
            WorkerState::Restarting => "restarting",
            WorkerState::GaveUp => "gave_up",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker is paused. Thermal pauses are released by recovery;
/// operator pauses are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Paused through the public API.
    Api,
    /// Paused by overheat self-preservation.
    Thermal,
}

/// Registration record for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Unique worker name.
    pub name: String,
    /// Launch command: program followed by its arguments.
    pub command: Vec<String>,
    /// Essential workers are never paused under thermal pressure.
    pub essential: bool,
    /// When set, the child is expected to refresh its heartbeat file at
    /// least this often; a stale beat marks it a zombie.
    pub heartbeat_max_age: Option<Duration>,
}

impl WorkerSpec {
    /// Creates a spec without heartbeat supervision.
    pub fn new(name: impl Into<String>, command: Vec<String>, essential: bool) -> Self {
        Self {
            name: name.into(),
            command,
            essential,
            heartbeat_max_age: None,
        }
    }

    /// Enables heartbeat-file liveness with the given staleness bound.
    pub fn with_heartbeat(mut self, max_age: Duration) -> Self {
        self.heartbeat_max_age = Some(max_age);
        self
    }
}

/// Orchestrator-private record of one supervised worker.
pub(crate) struct Worker {
    pub spec: WorkerSpec,
    pub child: Option<Child>,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub pause_reason: Option<PauseReason>,
    pub restart_count: u32,
    pub started_at: Option<Instant>,
    pub last_exit_code: Option<i32>,
    pub heartbeat_file: Option<PathBuf>,
}

impl Worker {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
            state: WorkerState::Stopped,
            pause_reason: None,
            restart_count: 0,
            started_at: None,
            last_exit_code: None,
            heartbeat_file: None,
        }
    }

    /// Serializable snapshot of this worker.
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.spec.name.clone(),
            state: self.state,
            pid: self.pid,
            restart_count: self.restart_count,
            essential: self.spec.essential,
            last_exit_code: self.last_exit_code,
        }
    }
}

/// Point-in-time view of one worker, embedded in heartbeat payloads.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// Worker name.
    pub name: String,
    /// Current liveness state.
    pub state: WorkerState,
    /// Child pid, when a child exists.
    pub pid: Option<u32>,
    /// Consecutive automatic restarts.
    pub restart_count: u32,
    /// Whether the worker is exempt from thermal pausing.
    pub essential: bool,
    /// Exit code of the most recent child exit.
    pub last_exit_code: Option<i32>,
}
