/// Message envelope decoding
///
/// Broker payloads wrap the application payload as
/// `{"message": {...}, "start"?: <number>}`. The bridge never interprets
/// `message`; it is carried through as opaque JSON.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;

/// Error type for envelope decoding
#[derive(Debug)]
pub enum EnvelopeError {
    Json(serde_json::Error),
    NotAnObject { found: &'static str },
    MissingMessage,
    MessageNotObject { found: &'static str },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Json(e) => write!(f, "Invalid envelope JSON: {}", e),
            EnvelopeError::NotAnObject { found } => {
                write!(f, "Envelope must be a JSON object, got {}", found)
            }
            EnvelopeError::MissingMessage => write!(f, "Envelope has no 'message' field"),
            EnvelopeError::MessageNotObject { found } => {
                write!(f, "Envelope 'message' must be an object, got {}", found)
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        EnvelopeError::Json(err)
    }
}

/// A single record handed to the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    pub value: JsonValue,
}

impl OutputRecord {
    pub fn to_frame(&self) -> Frame {
        let mut fields = Vec::with_capacity(2);
        if let Some(time) = self.time {
            fields.push(Field {
                name: "time",
                values: vec![JsonValue::from(time)],
            });
        }
        fields.push(Field {
            name: "value",
            values: vec![self.value.clone()],
        });

        Frame {
            name: FRAME_NAME,
            fields,
        }
    }
}

/// Name every outbound frame carries.
pub const FRAME_NAME: &str = "response";

/// Columnar frame: one row per forwarded record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub name: &'static str,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: &'static str,
    pub values: Vec<JsonValue>,
}

/// Decode a raw broker payload into an output record.
pub fn decode(raw: &[u8]) -> Result<OutputRecord, EnvelopeError> {
    let mut envelope = match serde_json::from_slice::<JsonValue>(raw)? {
        JsonValue::Object(map) => map,
        other => {
            return Err(EnvelopeError::NotAnObject {
                found: json_type_name(&other),
            })
        }
    };

    let value = match envelope.remove("message") {
        None | Some(JsonValue::Null) => return Err(EnvelopeError::MissingMessage),
        Some(value @ JsonValue::Object(_)) => value,
        Some(other) => {
            return Err(EnvelopeError::MessageNotObject {
                found: json_type_name(&other),
            })
        }
    };

    let time = match envelope.remove("start") {
        None => None,
        Some(start) => {
            let time = start.as_f64();
            if time.is_none() {
                tracing::debug!(start = %start, "Ignoring non-numeric start field");
            }
            time
        }
    };

    Ok(OutputRecord { time, value })
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
