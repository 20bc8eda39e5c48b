//! Request-terminating errors.
//!
//! Only setup failures and the two loop exits travel through this type.
//! Tolerated provisioning errors, per-tick pull errors and per-message decode
//! errors are logged where they happen and never surface here.

use std::fmt;

use crate::config::ConfigError;
use crate::nats::credentials::CredentialError;

#[derive(Debug)]
pub enum BridgeError {
    Config(ConfigError),
    Credentials(CredentialError),
    Connect(String),
    NamespaceRequest(String),
    NamespaceTimeout,
    NamespaceDecode(serde_json::Error),
    EmptyNamespace,
    InvalidRequest(String),
    InvalidStartTime { value: String, reason: String },
    Consumer(String),
    /// The caller cancelled the stream request.
    Cancelled,
    /// The subscriber can no longer receive records.
    SubscriberGone(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "Configuration error: {}", e),
            BridgeError::Credentials(e) => write!(f, "Credential error: {}", e),
            BridgeError::Connect(msg) => write!(f, "Unable to connect to broker: {}", msg),
            BridgeError::NamespaceRequest(msg) => write!(f, "Namespace request failed: {}", msg),
            BridgeError::NamespaceTimeout => write!(f, "Namespace request timed out"),
            BridgeError::NamespaceDecode(e) => write!(f, "Invalid namespace reply: {}", e),
            BridgeError::EmptyNamespace => write!(f, "Namespace reply carried an empty namespace"),
            BridgeError::InvalidRequest(msg) => write!(f, "Invalid stream request: {}", msg),
            BridgeError::InvalidStartTime { value, reason } => {
                write!(f, "Invalid start_time '{}': {}", value, reason)
            }
            BridgeError::Consumer(msg) => write!(f, "Unable to create consumer: {}", msg),
            BridgeError::Cancelled => write!(f, "Stream request cancelled"),
            BridgeError::SubscriberGone(msg) => write!(f, "Subscriber disconnected: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Config(e) => Some(e),
            BridgeError::Credentials(e) => Some(e),
            BridgeError::NamespaceDecode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Config(err)
    }
}

impl From<CredentialError> for BridgeError {
    fn from(err: CredentialError) -> Self {
        BridgeError::Credentials(err)
    }
}
