//! # Relay Bridge: JetStream to Live Stream
//!
//! Relay Bridge turns a durable, pull-based NATS JetStream consumer into a
//! push-style live feed. For each stream request it authenticates to the
//! broker, resolves the caller's tenant namespace, provisions a durable
//! stream plus a per-request pull consumer, and then pulls, acknowledges,
//! decodes and forwards messages until the caller cancels.
//!
//! ## Features
//!
//! - **Token+seed or username/password auth**: credentials are kept in memory or
//!   written to a request-scoped temporary file
//! - **Namespace resolution**: request/reply lookup on `accounts.user.get_namespace`
//! - **Idempotent provisioning**: one stream per namespace, one durable consumer per subscriber
//! - **Poll-forward loop**: one message per tick, explicit acks, cooperative cancellation
//! - **Opaque payloads**: the `message` object is forwarded without interpretation
//!
//! ## Example: Stream Request
//!
//! ```json
//! {
//!   "topic": "metrics",
//!   "start_time": "2024-01-01T00:00:00Z",
//!   "path": 1704067200
//! }
//! ```
//!
//! ## Example: Broker Payload
//!
//! ```json
//! {"message": {"val": 1}, "start": 1700000000}
//! ```
//!
//! is forwarded as a `response` frame with `time = 1700000000` and
//! `value = {"val": 1}`.

// Core modules
pub mod config;
pub mod error;
pub mod request;
pub mod datasource;

// NATS JetStream integration
pub mod nats;

// Re-export key types
pub use config::{AuthMode, BridgeSettings, ConfigError, Identity};
pub use error::BridgeError;
pub use request::StreamRequest;
pub use datasource::{ChannelStatus, Datasource, HealthCheckResult, HealthStatus};

// Re-export nats types
pub use nats::{
    CredentialStorage, DeliveryPolicy, EnvelopeError, Frame, LoopExit, LoopStats,
    OutputRecord, PollForwardLoop, RecordSink, Session, StreamTopic,
};
