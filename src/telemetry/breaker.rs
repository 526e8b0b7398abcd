//! # Circuit breaker guarding the telemetry endpoint.
//!
//! Standard three-state breaker:
//! - **Closed**: calls pass; consecutive failures are counted, and hitting
//!   the threshold opens the circuit.
//! - **Open**: calls are refused immediately until the timeout elapses,
//!   then the next admission attempt moves to half-open.
//! - **HalfOpen**: exactly one probe call is admitted; concurrent callers
//!   are refused. Probe success closes the circuit, probe failure re-opens
//!   it with a fresh timestamp.
//!
//! Callers must pair every successful [`CircuitBreaker::try_acquire`] with
//! exactly one `record_success` or `record_failure`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::TelemetryError;
use crate::events::{Bus, Event, EventKind};
use crate::metrics::MetricsRegistry;

/// State of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are refused.
    Open,
    /// One probe request is testing whether the endpoint recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker for the send pipeline.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    timeout: Duration,
    bus: Bus,
    metrics: MetricsRegistry,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// `failure_threshold` consecutive failures trip it; after `timeout`
    /// in the open state the next admission attempt becomes the probe.
    pub fn new(
        failure_threshold: u32,
        timeout: Duration,
        bus: Bus,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            timeout,
            bus,
            metrics,
        }
    }

    /// Returns the current state, applying the open → half-open timeout
    /// transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.roll_timeout(&mut inner);
        inner.state
    }

    /// Requests admission for one call.
    ///
    /// Returns `Err(CircuitOpen)` when the circuit refuses the call. A
    /// successful admission in the half-open state claims the single probe
    /// slot; the caller must release it via `record_success` /
    /// `record_failure`.
    pub fn try_acquire(&self) -> Result<(), TelemetryError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.roll_timeout(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                self.metrics.incr("breaker.refused");
                Err(TelemetryError::CircuitOpen)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    self.metrics.incr("breaker.refused");
                    Err(TelemetryError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                self.metrics.incr("breaker.closed");
                self.bus.publish(Event::now(EventKind::CircuitClosed));
            }
            // A success observed while open is stale; ignore it.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        self.metrics.incr("breaker.opened");
        self.bus.publish(Event::now(EventKind::CircuitOpened));
    }

    /// Open → HalfOpen once the timeout has elapsed.
    fn roll_timeout(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let expired = inner
            .opened_at
            .is_some_and(|t| t.elapsed() >= self.timeout);
        if expired {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}
