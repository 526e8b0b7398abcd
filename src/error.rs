//! # Error types used by the edgevisor runtime.
//!
//! This module defines the error enums for each subsystem:
//!
//! - [`ConfigError`] configuration parsing/validation failures (fatal at startup).
//! - [`WorkerError`] errors raised by orchestrator operations on workers.
//! - [`TelemetryError`] errors in the send pipeline and persistent queue.
//! - [`SampleError`] host vitals sampling failures (recovered locally).
//! - [`StartupError`] wiring failures during supervisor construction.
//!
//! All types provide `as_label()` short stable names for metrics.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while building the configuration record.
///
/// Any of these is fatal: the daemon refuses to start on a bad config.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An environment value could not be parsed into the expected type.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Configuration key (environment variable name).
        key: String,
        /// The offending raw value.
        value: String,
        /// Human-readable parse failure reason.
        reason: String,
    },
    /// A `workers` entry does not match `NAME:COMMAND:BOOL`.
    #[error("invalid worker spec '{entry}': {reason}")]
    InvalidWorkerSpec {
        /// The offending entry, verbatim.
        entry: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::InvalidValue { .. } => "config_invalid_value",
            ConfigError::InvalidWorkerSpec { .. } => "config_invalid_worker_spec",
        }
    }
}

/// Errors produced by orchestrator operations.
///
/// `DuplicateName`, `UnknownWorker` and `InvalidState` surface to the API
/// caller. `Spawn` surfaces only from a synchronous `start()`; under
/// watchdog restart it is accounted as a crashed attempt instead.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A worker with this name is already registered with a different spec.
    #[error("worker '{name}' is already registered")]
    DuplicateName {
        /// The duplicate worker name.
        name: String,
    },
    /// No worker with this name is registered.
    #[error("unknown worker '{name}'")]
    UnknownWorker {
        /// The missing worker name.
        name: String,
    },
    /// The worker already has a live child.
    #[error("worker '{name}' is already running")]
    AlreadyRunning {
        /// The worker name.
        name: String,
    },
    /// The operation is not valid in the worker's current state.
    #[error("worker '{name}' is {actual}, expected {expected}")]
    InvalidState {
        /// The worker name.
        name: String,
        /// State required by the operation.
        expected: &'static str,
        /// State the worker was actually in.
        actual: &'static str,
    },
    /// The OS refused to spawn the child process.
    #[error("failed to spawn worker '{name}': {source}")]
    Spawn {
        /// The worker name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Delivering a signal to the child failed.
    #[error("failed to signal worker '{name}' (pid {pid}): {source}")]
    Signal {
        /// The worker name.
        name: String,
        /// Target process id.
        pid: u32,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::DuplicateName { .. } => "worker_duplicate_name",
            WorkerError::UnknownWorker { .. } => "worker_unknown",
            WorkerError::AlreadyRunning { .. } => "worker_already_running",
            WorkerError::InvalidState { .. } => "worker_invalid_state",
            WorkerError::Spawn { .. } => "worker_spawn_failed",
            WorkerError::Signal { .. } => "worker_signal_failed",
        }
    }
}

/// Errors produced by the telemetry pipeline.
///
/// `CircuitOpen` means the call was refused without touching the network;
/// `SendFailed` means it was attempted and failed. The breaker needs this
/// distinction, so the two are never collapsed into one variant.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The circuit breaker refused the call.
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// The POST was attempted and failed (all retries exhausted).
    #[error("send failed: {reason}")]
    SendFailed {
        /// Last failure observed.
        reason: String,
    },
    /// The persistent queue hit an I/O error. Durability can no longer be
    /// guaranteed, so the supervisor treats this as fatal.
    #[error("persistent queue error: {0}")]
    QueueIo(#[from] rusqlite::Error),
    /// A payload could not be (de)serialized.
    #[error("payload serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Filesystem error around the queue's state directory.
    #[error("queue filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelemetryError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            TelemetryError::CircuitOpen => "telemetry_circuit_open",
            TelemetryError::SendFailed { .. } => "telemetry_send_failed",
            TelemetryError::QueueIo(_) => "telemetry_queue_io",
            TelemetryError::Serialize(_) => "telemetry_serialize",
            TelemetryError::Io(_) => "telemetry_io",
        }
    }

    /// True when the error was a breaker refusal (call never attempted).
    pub fn is_refusal(&self) -> bool {
        matches!(self, TelemetryError::CircuitOpen)
    }
}

/// Errors produced while sampling host vitals.
///
/// Always recovered locally: the monitor logs, counts and skips the tick.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SampleError {
    /// A vitals source could not be read.
    #[error("vitals source unavailable: {reason}")]
    Unavailable {
        /// What failed.
        reason: String,
    },
}

impl SampleError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            SampleError::Unavailable { .. } => "sample_unavailable",
        }
    }
}

/// Errors raised while wiring the supervisor at startup.
///
/// These map to exit code 2 (unrecoverable startup failure).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StartupError {
    /// The persistent queue could not be opened.
    #[error("telemetry store startup failed: {0}")]
    Telemetry(#[from] TelemetryError),
    /// The state directory could not be prepared.
    #[error("state directory {path} unusable: {source}")]
    StateDir {
        /// The directory that failed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// A configured worker could not be registered.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}
