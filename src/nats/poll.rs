/// Poll-forward loop
///
/// On every tick: pull at most one message, ack it, decode it, forward it.
/// The loop only ends on cancellation or when the subscriber goes away.
///
/// Acks happen before decoding, so a message that fails to decode is not
/// redelivered (at-most-once towards the subscriber).

use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::nats::envelope::{self, OutputRecord};

/// Error from a single pull or ack; always retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullError(pub String);

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PullError {}

/// The subscriber rejected a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardError(pub String);

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ForwardError {}

/// A pulled message that still has to be acknowledged.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), PullError>;
}

/// Source of at most one message per call.
#[async_trait]
pub trait MessageSource: Send {
    type Delivery: Delivery;

    /// `Ok(None)` means nothing was ready within the pull window.
    async fn pull(&mut self) -> Result<Option<Self::Delivery>, PullError>;
}

/// Receiver of output records.
#[async_trait]
pub trait RecordSink: Send {
    async fn send(&mut self, record: OutputRecord) -> Result<(), ForwardError>;
}

#[async_trait]
impl RecordSink for mpsc::Sender<OutputRecord> {
    async fn send(&mut self, record: OutputRecord) -> Result<(), ForwardError> {
        mpsc::Sender::send(self, record)
            .await
            .map_err(|_| ForwardError("record channel closed".to_string()))
    }
}

#[async_trait]
impl Delivery for jetstream::Message {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<(), PullError> {
        jetstream::Message::ack(self)
            .await
            .map_err(|e| PullError(e.to_string()))
    }
}

/// Bounded single-message pulls from a JetStream pull consumer.
pub struct JetStreamSource {
    consumer: jetstream::consumer::PullConsumer,
    expiry: Duration,
}

impl JetStreamSource {
    pub fn new(consumer: jetstream::consumer::PullConsumer, expiry: Duration) -> Self {
        Self { consumer, expiry }
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    type Delivery = jetstream::Message;

    async fn pull(&mut self) -> Result<Option<Self::Delivery>, PullError> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(self.expiry)
            .messages()
            .await
            .map_err(|e| PullError(e.to_string()))?;

        match batch.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(PullError(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Counters for one run of the loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub pulled: u64,
    pub forwarded: u64,
    pub pull_failures: u64,
    pub ack_failures: u64,
    pub decode_failures: u64,
}

/// How a run ended: always with an error, plus what happened before.
#[derive(Debug)]
pub struct LoopExit {
    pub stats: LoopStats,
    pub reason: BridgeError,
}

#[derive(Debug, Clone)]
pub struct PollForwardLoop {
    interval: Duration,
}

impl PollForwardLoop {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run<S, K>(&self, mut source: S, mut sink: K, cancel: CancellationToken) -> LoopExit
    where
        S: MessageSource,
        K: RecordSink,
    {
        let mut stats = LoopStats::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Poll loop started");

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break BridgeError::Cancelled,
                _ = ticker.tick() => {}
            }
            stats.ticks += 1;

            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break BridgeError::Cancelled,
                pulled = source.pull() => pulled,
            };

            let delivery = match pulled {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    stats.pull_failures += 1;
                    tracing::debug!(error = %e, "Pull returned no message");
                    continue;
                }
            };
            stats.pulled += 1;

            if let Err(e) = delivery.ack().await {
                stats.ack_failures += 1;
                tracing::warn!(error = %e, "Failed to ACK message");
            }

            let record = match envelope::decode(delivery.payload()) {
                Ok(record) => record,
                Err(e) => {
                    stats.decode_failures += 1;
                    tracing::warn!(error = %e, "Skipping undecodable message");
                    continue;
                }
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break BridgeError::Cancelled,
                sent = sink.send(record) => sent,
            };
            if let Err(e) = sent {
                tracing::warn!(error = %e, "Failed to forward record, stopping");
                break BridgeError::SubscriberGone(e.0);
            }
            stats.forwarded += 1;
        };

        tracing::info!(
            reason = %reason,
            ticks = stats.ticks,
            forwarded = stats.forwarded,
            decode_failures = stats.decode_failures,
            "Poll loop stopped"
        );

        LoopExit { stats, reason }
    }
}
