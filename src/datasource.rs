//! Host-facing datasource.
//!
//! Ties the stages together for one stream request:
//! credentials -> session -> provisioning -> poll-forward loop.
//! Any failure before the loop ends the request.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeSettings;
use crate::error::BridgeError;
use crate::nats::poll::{JetStreamSource, LoopExit, PollForwardLoop, RecordSink};
use crate::nats::{provision, session, Session};
use crate::request::StreamRequest;

pub const HEALTH_OK_MESSAGE: &str = "Connection successfully established";
pub const HEALTH_ERROR_MESSAGE: &str = "Connection not working";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: &'static str,
}

impl HealthCheckResult {
    pub fn from_probe(probe: &Result<(), BridgeError>) -> Self {
        match probe {
            Ok(()) => Self {
                status: HealthStatus::Ok,
                message: HEALTH_OK_MESSAGE,
            },
            Err(_) => Self {
                status: HealthStatus::Error,
                message: HEALTH_ERROR_MESSAGE,
            },
        }
    }
}

/// Answer to a subscribe or publish attempt on a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Ok,
    PermissionDenied,
}

pub struct Datasource {
    settings: BridgeSettings,
}

impl Datasource {
    pub fn new(settings: BridgeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Ok when a connection can be opened; no namespace lookup is made.
    pub async fn check_health(&self) -> HealthCheckResult {
        let probe = session::probe(&self.settings).await;
        if let Err(e) = &probe {
            tracing::warn!(error = %e, "Health check failed");
        }
        HealthCheckResult::from_probe(&probe)
    }

    /// Every caller may subscribe to a live channel.
    pub fn subscribe_stream(&self, path: &str) -> ChannelStatus {
        tracing::debug!(path, "Subscribe request");
        ChannelStatus::Ok
    }

    /// Subscribers never publish into the broker through the bridge.
    pub fn publish_stream(&self, path: &str) -> ChannelStatus {
        tracing::debug!(path, "Publish request denied");
        ChannelStatus::PermissionDenied
    }

    /// Run one stream request until `cancel` fires or the sink goes away.
    ///
    /// Setup failures are returned as errors. Once the loop has started the
    /// result is a [`LoopExit`] whose reason is `Cancelled` or
    /// `SubscriberGone`; the session and consumer are released before
    /// returning.
    pub async fn run_stream<K>(
        &self,
        request: StreamRequest,
        sink: K,
        cancel: CancellationToken,
    ) -> Result<LoopExit, BridgeError>
    where
        K: RecordSink,
    {
        request.validate()?;

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            session = Session::connect(&self.settings) => session?,
        };

        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            provisioned = provision::provision(&session, &request) => provisioned?,
        };

        let source = JetStreamSource::new(
            provisioned.consumer,
            self.settings.effective_pull_expiry(),
        );
        let exit = PollForwardLoop::new(self.settings.poll_interval)
            .run(source, sink, cancel)
            .await;

        tracing::info!(
            namespace = %session.namespace(),
            subject = %provisioned.topic.subject,
            consumer = %provisioned.spec.name,
            forwarded = exit.stats.forwarded,
            "Stream request finished"
        );
        drop(session);

        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_result_messages() {
        let ok = HealthCheckResult::from_probe(&Ok(()));
        assert_eq!(ok.status, HealthStatus::Ok);
        assert_eq!(ok.message, "Connection successfully established");

        let err = HealthCheckResult::from_probe(&Err(BridgeError::Connect("refused".to_string())));
        assert_eq!(err.status, HealthStatus::Error);
        assert_eq!(err.message, "Connection not working");
    }

    #[test]
    fn test_health_result_json() {
        let json = serde_json::to_value(HealthCheckResult::from_probe(&Ok(()))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "ok", "message": "Connection successfully established"})
        );
    }
}
