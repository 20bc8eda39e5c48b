//! Integration tests for the datasource surface that need no running broker

use relay_bridge::{
    AuthMode, BridgeError, BridgeSettings, ChannelStatus, Datasource, HealthStatus, Identity,
    OutputRecord, StreamRequest,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Settings pointing at a loopback port nothing listens on.
fn unreachable_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::new(
        "127.0.0.1",
        Identity {
            api_key: "key".to_string(),
            auth: AuthMode::UserPassword {
                username: "grafana".to_string(),
                password: "secret".to_string(),
            },
        },
    );
    settings.connect_timeout = Duration::from_secs(2);
    settings
}

#[tokio::test]
async fn test_health_reports_error_for_unreachable_broker() {
    let datasource = Datasource::new(unreachable_settings());

    let result = tokio::time::timeout(Duration::from_secs(10), datasource.check_health())
        .await
        .expect("health probe hung");

    assert_eq!(result.status, HealthStatus::Error);
    assert_eq!(result.message, "Connection not working");
}

#[tokio::test]
async fn test_stream_request_fails_when_broker_unreachable() {
    let datasource = Datasource::new(unreachable_settings());
    let (tx, _rx) = mpsc::channel::<OutputRecord>(1);

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        datasource.run_stream(StreamRequest::new("metrics"), tx, CancellationToken::new()),
    )
    .await
    .expect("connect attempt hung")
    .unwrap_err();

    assert!(matches!(err, BridgeError::Connect(_)), "{:?}", err);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_connecting() {
    let datasource = Datasource::new(unreachable_settings());
    let (tx, _rx) = mpsc::channel::<OutputRecord>(1);

    let err = datasource
        .run_stream(StreamRequest::new("metrics.*"), tx, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_bad_start_time_is_rejected_before_connecting() {
    // Unroutable address: reaching the connect step would stall for the full timeout.
    let mut settings = unreachable_settings();
    settings.host = "10.255.255.1".to_string();
    settings.connect_timeout = Duration::from_secs(30);
    let datasource = Datasource::new(settings);
    let (tx, _rx) = mpsc::channel::<OutputRecord>(1);

    let request = StreamRequest::new("metrics").with_start_time("2024-13-45");
    let err = tokio::time::timeout(
        Duration::from_secs(1),
        datasource.run_stream(request, tx, CancellationToken::new()),
    )
    .await
    .expect("start time was not checked before connecting")
    .unwrap_err();

    assert!(matches!(err, BridgeError::InvalidStartTime { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_cancelled_request_never_connects() {
    let datasource = Datasource::new(unreachable_settings());
    let (tx, _rx) = mpsc::channel::<OutputRecord>(1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = datasource
        .run_stream(StreamRequest::new("metrics"), tx, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Cancelled));
}

#[test]
fn test_channel_gates() {
    let datasource = Datasource::new(unreachable_settings());
    assert_eq!(datasource.subscribe_stream("1704067200"), ChannelStatus::Ok);
    assert_eq!(datasource.publish_stream("1704067200"), ChannelStatus::PermissionDenied);
}
