//! # Telemetry client: the resilient send pipeline.
//!
//! [`TelemetryClient`] combines retry, the circuit breaker and the durable
//! queue into a store-and-forward channel:
//!
//! ```text
//! handle.send(payload) ──► [bounded channel] ──► send worker
//!                               │ full                │
//!                               ▼                     ├─ post ─ retry ─ breaker ──► endpoint
//!                          PersistentQueue ◄── spill ─┘ (refused or exhausted)
//!                               ▲
//!                               └── flush loop: drain oldest batch when the
//!                                   breaker permits, every flush_interval
//! ```
//!
//! ## Rules
//! - `send()` never blocks the caller beyond one channel push; on
//!   backpressure the payload goes straight to the queue (`spilled`).
//! - The send worker is the only network writer; the flush loop reuses
//!   the same pipeline and backs off the moment the breaker trips.
//! - Flush preserves FIFO: a failing head entry blocks the queue rather
//!   than being skipped, and its `attempt_count` is recorded.
//! - A queue I/O error makes durability impossible, so the pipeline
//!   cancels the fatal token and the supervisor shuts down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TelemetryError;
use crate::events::{Bus, Event, EventKind};
use crate::metrics::MetricsRegistry;
use crate::telemetry::{
    breaker::{CircuitBreaker, CircuitState},
    payload::TelemetryPayload,
    queue::PersistentQueue,
    retry::RetryPolicy,
};

/// How many queued entries one flush pass attempts.
pub const FLUSH_BATCH_SIZE: usize = 50;

/// Delivery mechanism for one payload. Success is a 2xx response.
///
/// Abstracted so tests (and alternate uplinks) can stand in for HTTP.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one payload, returning `SendFailed` on any failure.
    async fn post(&self, payload: &TelemetryPayload) -> Result<(), TelemetryError>;
}

/// Production transport: JSON POST to the configured endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Builds the transport with a bounded socket timeout.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TelemetryError::SendFailed {
                reason: format!("http client init: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, payload: &TelemetryPayload) -> Result<(), TelemetryError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| TelemetryError::SendFailed {
                reason: e.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TelemetryError::SendFailed {
                reason: format!("http status {}", resp.status()),
            })
        }
    }
}

/// Shared internals of the send pipeline.
struct Pipeline {
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    queue: Arc<PersistentQueue>,
    bus: Bus,
    metrics: MetricsRegistry,
    /// Cancelled when the queue can no longer guarantee durability.
    fatal: CancellationToken,
}

impl Pipeline {
    /// One full send: breaker admission and bounded retries.
    ///
    /// `CircuitOpen` means the call was refused; `SendFailed` means every
    /// attempt was made and failed.
    async fn send_once(
        &self,
        payload: &TelemetryPayload,
        cancel: &CancellationToken,
    ) -> Result<(), TelemetryError> {
        let mut prev: Option<Duration> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.breaker.try_acquire()?;

            match self.transport.post(payload).await {
                Ok(()) => {
                    self.breaker.record_success();
                    return Ok(());
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if attempt >= self.retry.max_attempts.max(1) {
                        return Err(TelemetryError::SendFailed {
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.retry.next(prev);
                    prev = Some(delay);
                    debug!(attempt, ?delay, error = %e, "send attempt failed, backing off");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(TelemetryError::SendFailed {
                                reason: "cancelled during backoff".into(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Persists an undeliverable payload.
    fn spill(&self, payload: &TelemetryPayload, reason: &str) {
        match self.queue.enqueue(payload) {
            Ok(_) => {
                self.metrics.incr("telemetry.spilled");
                self.bus.publish(
                    Event::now(EventKind::TelemetrySpilled).with_error(reason.to_string()),
                );
            }
            Err(e) => self.fault(e),
        }
    }

    /// Reports a queue I/O failure and requests shutdown.
    fn fault(&self, e: TelemetryError) {
        self.metrics.incr("telemetry.queue_faults");
        self.bus
            .publish(Event::now(EventKind::QueueFault).with_error(e.to_string()));
        self.fatal.cancel();
    }

    /// One flush pass over the queue head. Returns entries attempted.
    async fn flush_once(&self, cancel: &CancellationToken) -> usize {
        if self.breaker.state() == CircuitState::Open {
            return 0;
        }
        let batch = match self.queue.peek_batch(FLUSH_BATCH_SIZE) {
            Ok(b) => b,
            Err(e) => {
                self.fault(e);
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }

        let mut attempted = 0usize;
        let mut delivered = 0u64;
        for entry in batch {
            if cancel.is_cancelled() {
                break;
            }
            attempted += 1;
            match self.send_once(&entry.payload, cancel).await {
                Ok(()) => {
                    if let Err(e) = self.queue.remove(entry.id) {
                        self.fault(e);
                        break;
                    }
                    delivered += 1;
                    self.metrics.incr("telemetry.flushed");
                }
                Err(err) => {
                    // FIFO: the head blocks; record the attempt and retry
                    // the same entry next tick.
                    if !err.is_refusal() {
                        if let Err(e) = self.queue.bump_attempt(entry.id) {
                            self.fault(e);
                        }
                    }
                    break;
                }
            }
        }
        if delivered > 0 {
            self.bus
                .publish(Event::now(EventKind::TelemetryFlushed).with_count(delivered));
        }
        attempted
    }
}

/// Cheap cloneable producer half of the telemetry channel.
#[derive(Clone)]
pub struct TelemetryHandle {
    tx: mpsc::Sender<TelemetryPayload>,
    pipeline: Arc<Pipeline>,
}

impl TelemetryHandle {
    /// Hands a payload to the send worker without blocking.
    ///
    /// When the channel is full (or the client has stopped) the payload is
    /// written directly to the persistent queue instead of being dropped.
    pub fn send(&self, payload: TelemetryPayload) {
        match self.tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(p)) => {
                self.pipeline.spill(&p, "send channel full");
            }
            Err(mpsc::error::TrySendError::Closed(p)) => {
                self.pipeline.spill(&p, "send worker stopped");
            }
        }
    }
}

/// Point-in-time pipeline statistics, embedded in heartbeat payloads.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryStats {
    /// Breaker state as a string (`closed` / `open` / `half-open`).
    pub circuit_state: String,
    /// Entries currently persisted in the queue.
    pub queued: u64,
    /// Payloads delivered directly.
    pub sent: u64,
    /// Payloads diverted to the queue.
    pub spilled: u64,
    /// Payloads delivered from the queue.
    pub flushed: u64,
}

/// Resilient outbound telemetry channel.
pub struct TelemetryClient {
    pipeline: Arc<Pipeline>,
    tx: mpsc::Sender<TelemetryPayload>,
    rx: Mutex<Option<mpsc::Receiver<TelemetryPayload>>>,
    flush_interval: Duration,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryClient {
    /// Wires the pipeline. Nothing runs until [`TelemetryClient::start`].
    ///
    /// `fatal` is cancelled if the queue ever fails an I/O operation; the
    /// supervisor watches it to begin graceful shutdown.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<PersistentQueue>,
        retry: RetryPolicy,
        circuit_failure_threshold: u32,
        circuit_timeout: Duration,
        flush_interval: Duration,
        channel_capacity: usize,
        bus: Bus,
        metrics: MetricsRegistry,
        fatal: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let breaker = CircuitBreaker::new(
            circuit_failure_threshold,
            circuit_timeout,
            bus.clone(),
            metrics.clone(),
        );
        let pipeline = Arc::new(Pipeline {
            transport,
            breaker,
            retry,
            queue,
            bus,
            metrics,
            fatal,
        });
        Self {
            pipeline,
            tx,
            rx: Mutex::new(Some(rx)),
            flush_interval,
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns a producer handle for other subsystems.
    pub fn handle(&self) -> TelemetryHandle {
        TelemetryHandle {
            tx: self.tx.clone(),
            pipeline: Arc::clone(&self.pipeline),
        }
    }

    /// Spawns the send worker and the flush loop. Idempotent.
    pub async fn start(&self) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };

        let pipeline = Arc::clone(&self.pipeline);
        let token = self.token.clone();
        let send_worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(payload) => {
                            match pipeline.send_once(&payload, &token).await {
                                Ok(()) => pipeline.metrics.incr("telemetry.sent"),
                                Err(e) => pipeline.spill(&payload, e.as_label()),
                            }
                        }
                        None => break,
                    }
                }
            }
            // Park whatever is still in flight so nothing is lost; the
            // final flush picks it up if the endpoint is reachable.
            while let Ok(payload) = rx.try_recv() {
                pipeline.spill(&payload, "shutdown drain");
            }
        });

        let pipeline = Arc::clone(&self.pipeline);
        let token = self.token.clone();
        let flush_interval = self.flush_interval;
        let flush_loop = tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let attempted = pipeline.flush_once(&token).await;
                        if attempted > 0 {
                            debug!(attempted, "flush pass finished");
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(send_worker);
        tasks.push(flush_loop);
        info!(flush_interval = ?self.flush_interval, "telemetry client started");
    }

    /// Opportunistically drains the queue now. Returns entries attempted.
    pub async fn flush(&self) -> usize {
        self.pipeline.flush_once(&self.token).await
    }

    /// Stops the loops and performs one final flush attempt.
    pub async fn stop(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for t in tasks {
            if t.await.is_err() {
                warn!("telemetry task panicked during shutdown");
            }
        }
        // Loops are down; one last chance for queued payloads to leave
        // the device before the process exits.
        let final_token = CancellationToken::new();
        let attempted = self.pipeline.flush_once(&final_token).await;
        info!(attempted, "telemetry client stopped");
    }

    /// Current pipeline statistics.
    pub fn stats(&self) -> TelemetryStats {
        let queued = self.pipeline.queue.len().unwrap_or(0);
        TelemetryStats {
            circuit_state: self.pipeline.breaker.state().to_string(),
            queued,
            sent: self.pipeline.metrics.counter("telemetry.sent"),
            spilled: self.pipeline.metrics.counter("telemetry.spilled"),
            flushed: self.pipeline.metrics.counter("telemetry.flushed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Transport whose health is flipped by the test.
    struct ScriptedTransport {
        healthy: AtomicBool,
        delivered: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                delivered: StdMutex::new(Vec::new()),
            })
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, payload: &TelemetryPayload) -> Result<(), TelemetryError> {
            if self.healthy.load(Ordering::SeqCst) {
                self.delivered.lock().unwrap().push(payload.id.clone());
                Ok(())
            } else {
                Err(TelemetryError::SendFailed {
                    reason: "connection refused".into(),
                })
            }
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            first: Duration::from_millis(1),
            max: Duration::from_millis(5),
            factor: 2.0,
            jitter: crate::telemetry::Jitter::None,
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> TelemetryClient {
        let queue = Arc::new(PersistentQueue::open_in_memory(None).unwrap());
        TelemetryClient::new(
            transport,
            queue,
            fast_retry(),
            3,
            Duration::from_millis(50),
            Duration::from_millis(20),
            4,
            Bus::new(64),
            MetricsRegistry::new(),
            CancellationToken::new(),
        )
    }

    fn payload(n: u32) -> TelemetryPayload {
        TelemetryPayload::new("edge-test", "event", json!({ "n": n }))
    }

    #[tokio::test]
    async fn send_once_delivers_when_healthy() {
        let transport = ScriptedTransport::new(true);
        let c = client(Arc::clone(&transport));
        let p = payload(1);
        c.pipeline
            .send_once(&p, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.delivered(), vec![p.id]);
    }

    #[tokio::test]
    async fn exhausted_retries_spill_to_queue() {
        let transport = ScriptedTransport::new(false);
        let c = client(Arc::clone(&transport));
        let p = payload(1);
        let err = c
            .pipeline
            .send_once(&p, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::SendFailed { .. }));
        c.pipeline.spill(&p, err.as_label());
        assert_eq!(c.pipeline.queue.len().unwrap(), 1);
        assert_eq!(c.pipeline.metrics.counter("telemetry.spilled"), 1);
    }

    #[tokio::test]
    async fn breaker_refuses_after_threshold() {
        let transport = ScriptedTransport::new(false);
        let c = client(Arc::clone(&transport));
        // Two failing sends at 2 attempts each cross the threshold of 3.
        for n in 0..2 {
            let _ = c
                .pipeline
                .send_once(&payload(n), &CancellationToken::new())
                .await;
        }
        let err = c
            .pipeline
            .send_once(&payload(9), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_refusal());
    }

    #[tokio::test]
    async fn flush_drains_fifo_and_preserves_head_blocking() {
        let transport = ScriptedTransport::new(false);
        let c = client(Arc::clone(&transport));
        let payloads: Vec<_> = (0..3).map(payload).collect();
        for p in &payloads {
            c.pipeline.queue.enqueue(p).unwrap();
        }

        // Endpoint down: nothing is removed, head attempt is recorded.
        let attempted = c.pipeline.flush_once(&CancellationToken::new()).await;
        assert_eq!(attempted, 1);
        let head = &c.pipeline.queue.peek_batch(1).unwrap()[0];
        assert_eq!(head.attempt_count, 1);
        assert_eq!(c.pipeline.queue.len().unwrap(), 3);

        // Endpoint back: the whole batch drains in order.
        transport.set_healthy(true);
        let attempted = c.pipeline.flush_once(&CancellationToken::new()).await;
        assert_eq!(attempted, 3);
        assert!(c.pipeline.queue.is_empty().unwrap());
        let expected: Vec<_> = payloads.iter().map(|p| p.id.clone()).collect();
        assert_eq!(transport.delivered(), expected);
    }

    #[tokio::test]
    async fn handle_spills_on_backpressure() {
        let transport = ScriptedTransport::new(true);
        let c = client(transport);
        let handle = c.handle();
        // Client not started: the channel (capacity 4) fills, the rest spill.
        for n in 0..6 {
            handle.send(payload(n));
        }
        assert_eq!(c.pipeline.queue.len().unwrap(), 2);
        assert_eq!(c.pipeline.metrics.counter("telemetry.spilled"), 2);
    }
}
