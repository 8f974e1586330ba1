//! Envelope codec - queue body → `JobEnvelope`
//!
//! Two wire shapes are accepted:
//! - direct: `{"type": "...", "payload": ...}`
//! - wrapped (legacy producers): `["<tag>", {"type": "...", "payload": ...}]`
//!
//! Anything else is malformed. Decoding is a pure function; the worker decides
//! what to do with a malformed job.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{JobEnvelope, JobId};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("body is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("unexpected envelope shape: {0}")]
    Shape(String),
}

/// The `{type, payload}` object shared by both wire shapes.
///
/// `payload` may be omitted and then decodes as `null`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnvelopeBody {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireEnvelope {
    Direct(EnvelopeBody),
    Wrapped { tag: Value, inner: EnvelopeBody },
}

impl WireEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Object(_) => Ok(WireEnvelope::Direct(body_from_object(value)?)),
            Value::Array(items) => {
                let [tag, inner]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
                    CodecError::Shape(format!("wrapped envelope has {} elements, expected 2", items.len()))
                })?;
                if !inner.is_object() {
                    return Err(CodecError::Shape(
                        "second element of wrapped envelope is not an object".to_string(),
                    ));
                }
                Ok(WireEnvelope::Wrapped {
                    tag,
                    inner: body_from_object(inner)?,
                })
            }
            other => Err(CodecError::Shape(format!("expected object or array, got {}", kind(&other)))),
        }
    }

    pub fn into_body(self) -> EnvelopeBody {
        match self {
            WireEnvelope::Direct(body) => body,
            WireEnvelope::Wrapped { inner, .. } => inner,
        }
    }
}

/// Decode a reserved job body into the envelope routing works on.
pub fn decode(id: JobId, body: &[u8]) -> Result<JobEnvelope, CodecError> {
    let body = WireEnvelope::parse(body)?.into_body();
    Ok(JobEnvelope::new(id, body.job_type, body.payload))
}

// Must only be called with an object: derived structs also accept sequences.
fn body_from_object(value: Value) -> Result<EnvelopeBody, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::Shape(e.to_string()))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
