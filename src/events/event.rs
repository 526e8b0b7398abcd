//! # Runtime events emitted by the supervisor's subsystems.
//!
//! [`EventKind`] classifies events across four areas:
//! - **Worker lifecycle**: spawn, exit, restart ceiling, pause/resume.
//! - **Health**: thermal transitions and resource pressure.
//! - **Telemetry**: spills, flushes, breaker transitions, queue faults.
//! - **Runtime**: shutdown phases and subscriber diagnostics.
//!
//! [`Event`] carries optional metadata (worker name, pid, exit code, ...)
//! attached with builder-style `with_*` methods.
//!
//! ## Ordering
//! Every event gets a globally unique, monotonically increasing sequence
//! number (`seq`), so subscribers can order events delivered through async
//! channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Worker lifecycle ===
    /// A worker was registered with the orchestrator.
    WorkerRegistered,
    /// A child process was spawned for a worker.
    WorkerStarted,
    /// A running worker's child exited (crash or natural exit).
    WorkerExited,
    /// The OS refused to spawn a worker's child.
    WorkerSpawnFailed,
    /// A worker reached its restart ceiling and will not be retried.
    WorkerGaveUp,
    /// A worker was suspended with the job-control stop signal.
    WorkerPaused,
    /// A suspended worker was continued.
    WorkerResumed,
    /// A worker's child was stopped deliberately.
    WorkerStopped,
    /// A running child stopped refreshing its heartbeat file and was killed.
    WorkerZombie,
    /// Some children ignored the termination signal and were killed.
    StopEscalated,

    // === Health ===
    /// Temperature crossed the overheat threshold; self-preservation engaged.
    Overheat,
    /// Temperature fell back below the hysteresis margin; workers resumed.
    Recovered,
    /// CPU or memory exceeded its warning threshold.
    ResourcePressure,
    /// A vitals sample could not be taken this tick.
    SampleFailed,

    // === Telemetry ===
    /// A payload could not be delivered and was written to the queue.
    TelemetrySpilled,
    /// Queued payloads were delivered by the flush loop.
    TelemetryFlushed,
    /// The circuit breaker tripped open.
    CircuitOpened,
    /// The circuit breaker closed after a successful probe.
    CircuitClosed,
    /// The persistent queue hit an I/O error (fatal).
    QueueFault,

    // === Runtime ===
    /// Shutdown requested (OS signal received or fatal fault).
    ShutdownRequested,
    /// A subscriber panicked while processing an event.
    SubscriberPanicked,
    /// A subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Worker name, if applicable.
    pub worker: Option<String>,
    /// Child process id, if applicable.
    pub pid: Option<u32>,
    /// Child exit code, if the event represents an exit.
    pub exit_code: Option<i32>,
    /// Consecutive restart count at the time of the event.
    pub restarts: Option<u32>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
    /// Temperature reading in Celsius.
    pub temp_c: Option<f64>,
    /// CPU utilisation percentage.
    pub cpu_pct: Option<f64>,
    /// Memory utilisation percentage.
    pub mem_pct: Option<f64>,
    /// Generic count (queued rows, flushed payloads, ...).
    pub count: Option<u64>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp
    /// and next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            worker: None,
            pid: None,
            exit_code: None,
            restarts: None,
            error: None,
            temp_c: None,
            cpu_pct: None,
            mem_pct: None,
            count: None,
        }
    }

    /// Attaches a worker name.
    pub fn with_worker(mut self, name: impl Into<String>) -> Self {
        self.worker = Some(name.into());
        self
    }

    /// Attaches a process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches an exit code.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Attaches a restart count.
    pub fn with_restarts(mut self, n: u32) -> Self {
        self.restarts = Some(n);
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Attaches a temperature reading.
    pub fn with_temp(mut self, c: f64) -> Self {
        self.temp_c = Some(c);
        self
    }

    /// Attaches CPU and memory utilisation.
    pub fn with_load(mut self, cpu_pct: f64, mem_pct: f64) -> Self {
        self.cpu_pct = Some(cpu_pct);
        self.mem_pct = Some(mem_pct);
        self
    }

    /// Attaches a generic count.
    pub fn with_count(mut self, n: u64) -> Self {
        self.count = Some(n);
        self
    }

    /// Creates a subscriber overflow event.
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow)
            .with_error(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::now(EventKind::SubscriberPanicked)
            .with_worker(subscriber)
            .with_error(info)
    }

    /// True for events produced by the subscriber machinery itself.
    ///
    /// These must not trigger further overflow diagnostics, or a full
    /// queue would feed itself forever.
    pub(crate) fn is_subscriber_diagnostic(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}
