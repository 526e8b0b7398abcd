//! End-to-end store-and-forward: payloads sent during an outage land in
//! the durable queue and drain in FIFO order once the endpoint returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use edgevisor::{
    Bus, Jitter, MetricsRegistry, PersistentQueue, RetryPolicy, TelemetryClient, TelemetryError,
    TelemetryPayload, Transport,
};

/// Endpoint whose availability the test script controls.
struct FlakyEndpoint {
    healthy: AtomicBool,
    received: Mutex<Vec<String>>,
}

impl FlakyEndpoint {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            received: Mutex::new(Vec::new()),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FlakyEndpoint {
    async fn post(&self, payload: &TelemetryPayload) -> Result<(), TelemetryError> {
        if self.healthy.load(Ordering::SeqCst) {
            self.received.lock().unwrap().push(payload.id.clone());
            Ok(())
        } else {
            Err(TelemetryError::SendFailed {
                reason: "connection refused".into(),
            })
        }
    }
}

fn make_client(
    transport: Arc<FlakyEndpoint>,
    queue: Arc<PersistentQueue>,
) -> TelemetryClient {
    TelemetryClient::new(
        transport,
        queue,
        RetryPolicy {
            max_attempts: 1,
            first: Duration::from_millis(1),
            max: Duration::from_millis(5),
            factor: 2.0,
            jitter: Jitter::None,
        },
        2,
        Duration::from_millis(100),
        Duration::from_millis(50),
        16,
        Bus::new(64),
        MetricsRegistry::new(),
        CancellationToken::new(),
    )
}

fn payload(n: u32) -> TelemetryPayload {
    TelemetryPayload::new("edge-test", "event", json!({ "n": n }))
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn outage_spills_then_flush_drains_in_order() {
    let transport = FlakyEndpoint::new(false);
    let queue = Arc::new(PersistentQueue::open_in_memory(None).unwrap());
    let client = make_client(Arc::clone(&transport), Arc::clone(&queue));
    client.start().await;

    let payloads: Vec<_> = (0..5).map(payload).collect();
    let handle = client.handle();
    for p in payloads.clone() {
        handle.send(p);
    }

    // Breaker trips after the first failures; everything ends up queued.
    {
        let queue = Arc::clone(&queue);
        wait_until(move || queue.len().unwrap() == 5, "all payloads queued").await;
    }
    let queued = queue.peek_batch(10).unwrap();
    let queued_ids: Vec<_> = queued.iter().map(|e| e.payload.id.clone()).collect();
    let sent_ids: Vec<_> = payloads.iter().map(|p| p.id.clone()).collect();
    assert_eq!(queued_ids, sent_ids, "queue preserves enqueue order");

    // Endpoint restored: the flush loop drains everything, oldest first.
    transport.set_healthy(true);
    {
        let queue = Arc::clone(&queue);
        wait_until(move || queue.is_empty().unwrap(), "queue drained").await;
    }
    assert_eq!(transport.received(), sent_ids, "delivery preserves FIFO");

    client.stop().await;
}

#[tokio::test]
async fn stop_performs_a_final_flush() {
    let transport = FlakyEndpoint::new(true);
    let queue = Arc::new(PersistentQueue::open_in_memory(None).unwrap());
    for n in 0..3 {
        queue.enqueue(&payload(n)).unwrap();
    }

    let client = make_client(Arc::clone(&transport), Arc::clone(&queue));
    client.start().await;
    client.stop().await;

    assert!(queue.is_empty().unwrap());
    assert_eq!(transport.received().len(), 3);
}

#[tokio::test]
async fn stats_reflect_pipeline_activity() {
    let transport = FlakyEndpoint::new(true);
    let queue = Arc::new(PersistentQueue::open_in_memory(None).unwrap());
    let client = make_client(Arc::clone(&transport), Arc::clone(&queue));
    client.start().await;

    client.handle().send(payload(1));
    {
        let transport = Arc::clone(&transport);
        wait_until(move || !transport.received().is_empty(), "payload delivered").await;
    }

    let stats = client.stats();
    assert_eq!(stats.circuit_state, "closed");
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.queued, 0);

    client.stop().await;
}
