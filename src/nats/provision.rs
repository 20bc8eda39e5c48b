/// Stream and consumer provisioning
///
/// Every namespace owns one durable stream (`<namespace>_stream`); each topic
/// maps to the subject `<stream>_<topic>` on it. A stream request gets a
/// durable pull consumer filtered on that subject, created or updated in
/// place so repeated requests from the same subscriber reuse one position.

use async_nats::jetstream::{self, consumer};
use chrono::{DateTime, Utc};

use crate::error::BridgeError;
use crate::nats::session::Session;
use crate::request::StreamRequest;

/// Names derived from a namespace and a requested topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTopic {
    pub stream_name: String,
    pub subject: String,
}

impl StreamTopic {
    pub fn derive(namespace: &str, topic: &str) -> Self {
        let stream_name = format!("{}_stream", namespace);
        let subject = format!("{}_{}", stream_name, topic);
        Self { stream_name, subject }
    }
}

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    FromStart(DateTime<Utc>),
    NewOnly,
}

impl DeliveryPolicy {
    /// Parse an optional RFC3339 start time. Parse failures are fatal.
    pub fn from_start_time(start_time: Option<&str>) -> Result<Self, BridgeError> {
        match start_time {
            None => Ok(DeliveryPolicy::NewOnly),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| DeliveryPolicy::FromStart(dt.with_timezone(&Utc)))
                .map_err(|e| BridgeError::InvalidStartTime {
                    value: raw.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn to_deliver_policy(self) -> Result<consumer::DeliverPolicy, BridgeError> {
        match self {
            DeliveryPolicy::NewOnly => Ok(consumer::DeliverPolicy::New),
            DeliveryPolicy::FromStart(start) => {
                let nanos = i128::from(start.timestamp()) * 1_000_000_000
                    + i128::from(start.timestamp_subsec_nanos());
                let start_time = time::OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(
                    |e| BridgeError::InvalidStartTime {
                        value: start.to_rfc3339(),
                        reason: e.to_string(),
                    },
                )?;
                Ok(consumer::DeliverPolicy::ByStartTime { start_time })
            }
        }
    }
}

/// Everything needed to create or update the per-request consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    pub filter_subject: String,
    pub delivery: DeliveryPolicy,
}

impl ConsumerSpec {
    pub fn new(topic: &StreamTopic, request: &StreamRequest) -> Result<Self, BridgeError> {
        let delivery = DeliveryPolicy::from_start_time(request.start_time())?;
        // A path is shared by every topic of one query, so the topic is
        // part of the name.
        let name = match request.path.as_deref() {
            Some(path) => consumer_name(&format!("{}_{}", path, request.topic)),
            None => consumer_name(&topic.subject),
        };

        Ok(Self {
            name,
            filter_subject: topic.subject.clone(),
            delivery,
        })
    }

    /// Durable pull config: explicit acks, instant replay.
    pub fn to_pull_config(&self) -> Result<consumer::pull::Config, BridgeError> {
        Ok(consumer::pull::Config {
            durable_name: Some(self.name.clone()),
            filter_subject: self.filter_subject.clone(),
            deliver_policy: self.delivery.to_deliver_policy()?,
            ack_policy: consumer::AckPolicy::Explicit,
            replay_policy: consumer::ReplayPolicy::Instant,
            ..Default::default()
        })
    }
}

/// Map an identifier onto a valid consumer name.
///
/// Consumer names may not contain `.`, `*`, `>`, path separators or whitespace.
pub fn consumer_name(identifier: &str) -> String {
    let name: String = identifier
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | '/' | '\\' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();

    if name.is_empty() {
        "relay_consumer".to_string()
    } else {
        name
    }
}

/// A ready-to-pull consumer bound to one subject.
pub struct ProvisionedConsumer {
    pub topic: StreamTopic,
    pub spec: ConsumerSpec,
    pub consumer: consumer::PullConsumer,
}

/// Ensure the namespace stream carries the subject, then create or update
/// the pull consumer.
///
/// Stream errors are logged and tolerated; consumer errors are fatal.
pub async fn provision(
    session: &Session,
    request: &StreamRequest,
) -> Result<ProvisionedConsumer, BridgeError> {
    provision_in(&session.jetstream(), session.namespace(), request).await
}

/// Same as [`provision`], against an explicit JetStream context and namespace.
pub async fn provision_in(
    jetstream: &jetstream::Context,
    namespace: &str,
    request: &StreamRequest,
) -> Result<ProvisionedConsumer, BridgeError> {
    let topic = StreamTopic::derive(namespace, &request.topic);
    let spec = ConsumerSpec::new(&topic, request)?;

    if let Err(e) = ensure_stream(jetstream, &topic).await {
        tracing::warn!(
            stream = %topic.stream_name,
            subject = %topic.subject,
            error = %e,
            "Stream provisioning failed, continuing with consumer"
        );
    }

    let consumer = upsert_consumer(jetstream, &topic, &spec).await?;

    tracing::info!(
        stream = %topic.stream_name,
        subject = %topic.subject,
        consumer = %spec.name,
        delivery = ?spec.delivery,
        "Consumer ready"
    );

    Ok(ProvisionedConsumer { topic, spec, consumer })
}

async fn ensure_stream(
    jetstream: &jetstream::Context,
    topic: &StreamTopic,
) -> Result<(), async_nats::Error> {
    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: topic.stream_name.clone(),
            subjects: vec![topic.subject.clone()],
            ..Default::default()
        })
        .await?;

    let info = stream.cached_info();
    if info.config.subjects.iter().any(|s| s == &topic.subject) {
        tracing::debug!(stream = %topic.stream_name, "Stream already carries subject");
        return Ok(());
    }

    // Another topic created the stream first; add this subject to it.
    let mut config = info.config.clone();
    config.subjects.push(topic.subject.clone());
    jetstream.update_stream(&config).await?;

    tracing::info!(
        stream = %topic.stream_name,
        subject = %topic.subject,
        "Added subject to existing stream"
    );
    Ok(())
}

async fn upsert_consumer(
    jetstream: &jetstream::Context,
    topic: &StreamTopic,
    spec: &ConsumerSpec,
) -> Result<consumer::PullConsumer, BridgeError> {
    let config = spec.to_pull_config()?;

    match jetstream
        .create_consumer_on_stream(config.clone(), topic.stream_name.as_str())
        .await
    {
        Ok(consumer) => Ok(consumer),
        Err(update_err) => {
            // Deliver policy and start time cannot be updated in place; the
            // consumer is replaced so the requested position always applies.
            tracing::warn!(
                consumer = %spec.name,
                error = %update_err,
                "Consumer update refused, recreating consumer"
            );
            jetstream
                .delete_consumer_from_stream(spec.name.as_str(), topic.stream_name.as_str())
                .await
                .map_err(|e| {
                    BridgeError::Consumer(format!("{} (delete failed: {})", update_err, e))
                })?;
            jetstream
                .create_consumer_on_stream(config, topic.stream_name.as_str())
                .await
                .map_err(|e| BridgeError::Consumer(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stream_topic_derivation() {
        let topic = StreamTopic::derive("acme", "metrics");
        assert_eq!(topic.stream_name, "acme_stream");
        assert_eq!(topic.subject, "acme_stream_metrics");
        assert_eq!(topic, StreamTopic::derive("acme", "metrics"));
        assert_ne!(topic.subject, StreamTopic::derive("acme", "logs").subject);
        assert_ne!(topic.subject, StreamTopic::derive("other", "metrics").subject);
    }

    #[test]
    fn test_delivery_policy_from_start_time() {
        let policy = DeliveryPolicy::from_start_time(Some("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(
            policy,
            DeliveryPolicy::FromStart(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );

        let policy = DeliveryPolicy::from_start_time(Some("2024-01-01T02:00:00+02:00")).unwrap();
        assert_eq!(
            policy,
            DeliveryPolicy::FromStart(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );

        assert_eq!(DeliveryPolicy::from_start_time(None).unwrap(), DeliveryPolicy::NewOnly);
    }

    #[test]
    fn test_malformed_start_time_is_fatal() {
        let err = DeliveryPolicy::from_start_time(Some("yesterday")).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidStartTime { ref value, .. } if value == "yesterday"));
    }

    #[test]
    fn test_pull_config_from_start() {
        let topic = StreamTopic::derive("acme", "metrics");
        let request = StreamRequest::new("metrics")
            .with_start_time("2024-01-01T00:00:00Z")
            .with_path("1704067200");
        let spec = ConsumerSpec::new(&topic, &request).unwrap();
        let config = spec.to_pull_config().unwrap();

        assert_eq!(config.durable_name.as_deref(), Some("1704067200_metrics"));
        assert_eq!(config.filter_subject, "acme_stream_metrics");
        assert_eq!(config.ack_policy, consumer::AckPolicy::Explicit);
        assert_eq!(config.replay_policy, consumer::ReplayPolicy::Instant);
        match config.deliver_policy {
            consumer::DeliverPolicy::ByStartTime { start_time } => {
                assert_eq!(start_time.unix_timestamp(), 1_704_067_200);
            }
            other => panic!("unexpected deliver policy {:?}", other),
        }
    }

    #[test]
    fn test_pull_config_new_only() {
        let topic = StreamTopic::derive("acme", "metrics");
        let spec = ConsumerSpec::new(&topic, &StreamRequest::new("metrics")).unwrap();
        let config = spec.to_pull_config().unwrap();

        assert_eq!(config.deliver_policy, consumer::DeliverPolicy::New);
        assert_eq!(config.durable_name.as_deref(), Some("acme_stream_metrics"));
    }

    #[test]
    fn test_same_path_yields_same_consumer_name() {
        let topic = StreamTopic::derive("acme", "metrics");
        let request = StreamRequest::new("metrics").with_path("panel-7");

        let first = ConsumerSpec::new(&topic, &request).unwrap();
        let second = ConsumerSpec::new(&topic, &request).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "panel-7_metrics");
    }

    #[test]
    fn test_topics_sharing_a_path_get_separate_consumers() {
        let request = StreamRequest::new("metrics").with_path("1704067200");
        let metrics = ConsumerSpec::new(&StreamTopic::derive("acme", "metrics"), &request).unwrap();

        let request = StreamRequest::new("logs").with_path("1704067200");
        let logs = ConsumerSpec::new(&StreamTopic::derive("acme", "logs"), &request).unwrap();

        assert_ne!(metrics.name, logs.name);
        assert_ne!(metrics.filter_subject, logs.filter_subject);
    }

    #[test]
    fn test_dotted_topic_with_path_yields_valid_name() {
        let request = StreamRequest::new("orders.eu").with_path("1704067200");
        let spec = ConsumerSpec::new(&StreamTopic::derive("acme", "orders.eu"), &request).unwrap();
        assert_eq!(spec.name, "1704067200_orders_eu");
    }

    #[test]
    fn test_consumer_name_sanitization() {
        assert_eq!(consumer_name("acme_stream_orders.eu"), "acme_stream_orders_eu");
        assert_eq!(consumer_name("d/abc uid>*"), "d_abc_uid__");
        assert_eq!(consumer_name("   "), "relay_consumer");
    }
}
