//! Inbound stream requests.
//!
//! `{ "topic": string, "start_time"?: RFC3339 string, "path"?: identifier }`

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use crate::error::BridgeError;
use crate::nats::provision::DeliveryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamRequest {
    pub topic: String,

    /// Absolute start time; absent or blank selects new-messages-only delivery.
    #[serde(default)]
    pub start_time: Option<String>,

    /// Stable identifier of the logical subscription (string or integer).
    #[serde(default, deserialize_with = "deserialize_path")]
    pub path: Option<String>,
}

impl StreamRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            start_time: None,
            path: None,
        }
    }

    pub fn with_start_time(mut self, start_time: impl Into<String>) -> Self {
        self.start_time = Some(start_time.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Parse and validate a request body.
    pub fn from_json(body: &[u8]) -> Result<Self, BridgeError> {
        let request: StreamRequest = serde_json::from_slice(body)
            .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Topics become part of a subject, so wildcards and whitespace are
    /// refused. The start time is parsed here so a bad one never reaches the
    /// broker.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let topic = self.topic.as_str();
        if topic.is_empty() {
            return Err(BridgeError::InvalidRequest("topic must not be empty".to_string()));
        }
        if topic
            .chars()
            .any(|c| c.is_whitespace() || c == '*' || c == '>')
        {
            return Err(BridgeError::InvalidRequest(format!(
                "topic '{}' contains wildcard or whitespace characters",
                topic
            )));
        }
        // The stream prefix precedes the topic, so only a trailing dot or a
        // double dot leaves an empty token in the subject.
        if topic.ends_with('.') || topic.contains("..") {
            return Err(BridgeError::InvalidRequest(format!(
                "topic '{}' contains an empty subject token",
                topic
            )));
        }
        DeliveryPolicy::from_start_time(self.start_time())?;
        Ok(())
    }

    /// The start time, if one was actually supplied.
    pub fn start_time(&self) -> Option<&str> {
        self.start_time
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

fn deserialize_path<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "path must be a string or integer, got {}",
            other
        ))),
    }
}
