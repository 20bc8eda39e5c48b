//! Integration tests for the poll-forward loop using in-memory sources and sinks

use async_trait::async_trait;
use relay_bridge::nats::poll::{Delivery, ForwardError, MessageSource, PullError, RecordSink};
use relay_bridge::{BridgeError, OutputRecord, PollForwardLoop};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(5);

struct QueuedDelivery {
    id: usize,
    payload: Vec<u8>,
    acked: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl Delivery for QueuedDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), PullError> {
        self.acked.lock().unwrap().push(self.id);
        Ok(())
    }
}

/// Hands out queued payloads one per pull, then reports empty pulls.
struct QueueSource {
    queue: VecDeque<Vec<u8>>,
    next_id: usize,
    acked: Arc<Mutex<Vec<usize>>>,
}

impl QueueSource {
    fn new(payloads: &[&str]) -> Self {
        Self {
            queue: payloads.iter().map(|p| p.as_bytes().to_vec()).collect(),
            next_id: 0,
            acked: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl MessageSource for QueueSource {
    type Delivery = QueuedDelivery;

    async fn pull(&mut self) -> Result<Option<QueuedDelivery>, PullError> {
        match self.queue.pop_front() {
            Some(payload) => {
                let id = self.next_id;
                self.next_id += 1;
                Ok(Some(QueuedDelivery {
                    id,
                    payload,
                    acked: self.acked.clone(),
                }))
            }
            None => Err(PullError("no messages".to_string())),
        }
    }
}

/// A source whose pulls never complete.
struct StalledSource;

#[async_trait]
impl MessageSource for StalledSource {
    type Delivery = QueuedDelivery;

    async fn pull(&mut self) -> Result<Option<QueuedDelivery>, PullError> {
        futures::future::pending().await
    }
}

/// Accepts a fixed number of records, then reports the subscriber as gone.
struct FlakySink {
    accepted: Vec<OutputRecord>,
    capacity: usize,
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn send(&mut self, record: OutputRecord) -> Result<(), ForwardError> {
        if self.accepted.len() >= self.capacity {
            return Err(ForwardError("subscriber disconnected".to_string()));
        }
        self.accepted.push(record);
        Ok(())
    }
}

#[tokio::test]
async fn test_missing_message_is_skipped_and_later_records_delivered() {
    let source = QueueSource::new(&[
        r#"{"message": {"seq": 1}}"#,
        r#"{"start": 5}"#,
        r#"not json"#,
        r#"{"message": {"seq": 2}, "start": 1700000000}"#,
    ]);
    let acked = source.acked.clone();
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { PollForwardLoop::new(TICK).run(source, tx, cancel).await }
    });

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.value, json!({"seq": 1}));
    assert_eq!(second.value, json!({"seq": 2}));
    assert_eq!(second.time, Some(1_700_000_000.0));

    cancel.cancel();
    let exit = handle.await.unwrap();

    assert!(matches!(exit.reason, BridgeError::Cancelled));
    assert_eq!(exit.stats.pulled, 4);
    assert_eq!(exit.stats.forwarded, 2);
    assert_eq!(exit.stats.decode_failures, 2);
    // Undecodable messages were acknowledged too, so they are never redelivered.
    assert_eq!(*acked.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_records_keep_broker_order() {
    let payloads: Vec<String> = (0..10)
        .map(|i| format!(r#"{{"message": {{"seq": {}}}}}"#, i))
        .collect();
    let refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
    let source = QueueSource::new(&refs);
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { PollForwardLoop::new(Duration::from_millis(1)).run(source, tx, cancel).await }
    });

    for expected in 0..10 {
        let record = rx.recv().await.unwrap();
        assert_eq!(record.value, json!({"seq": expected}));
    }

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancellation_stops_within_a_tick() {
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1);
    let looper = PollForwardLoop::new(Duration::from_millis(50));

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { looper.run(QueueSource::new(&[]), tx, cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();

    let exit = tokio::time::timeout(Duration::from_millis(50), handle)
        .await
        .expect("loop did not stop within one tick")
        .unwrap();
    assert!(matches!(exit.reason, BridgeError::Cancelled));
    assert!(exit.stats.ticks >= 2);
    assert_eq!(exit.stats.forwarded, 0);
}

#[tokio::test]
async fn test_cancellation_interrupts_a_stalled_pull() {
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1);

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { PollForwardLoop::new(TICK).run(StalledSource, tx, cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("stalled pull blocked cancellation")
        .unwrap();
    assert!(matches!(exit.reason, BridgeError::Cancelled));
    assert_eq!(exit.stats.ticks, 1);
}

#[tokio::test]
async fn test_forwarding_failure_ends_the_loop() {
    let source = QueueSource::new(&[
        r#"{"message": {"seq": 1}}"#,
        r#"{"message": {"seq": 2}}"#,
        r#"{"message": {"seq": 3}}"#,
    ]);
    let sink = FlakySink {
        accepted: Vec::new(),
        capacity: 1,
    };

    let exit = tokio::time::timeout(
        Duration::from_secs(1),
        PollForwardLoop::new(TICK).run(source, sink, CancellationToken::new()),
    )
    .await
    .expect("loop kept running after the subscriber left");

    assert!(matches!(exit.reason, BridgeError::SubscriberGone(_)));
    assert_eq!(exit.stats.forwarded, 1);
    assert_eq!(exit.stats.pulled, 2);
}

#[tokio::test]
async fn test_dropped_receiver_ends_the_loop() {
    let source = QueueSource::new(&[r#"{"message": {"seq": 1}}"#]);
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let exit = tokio::time::timeout(
        Duration::from_secs(1),
        PollForwardLoop::new(TICK).run(source, tx, CancellationToken::new()),
    )
    .await
    .unwrap();

    assert!(matches!(exit.reason, BridgeError::SubscriberGone(_)));
}
