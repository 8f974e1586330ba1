//! JobEnvelope - the normalised job the engine routes.
//!
//! Whatever shape arrived on the wire, routing only ever sees this type.
//! See `typed::codec` for the decoding side.

use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// Job id + type tag + payload (opaque to the engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    id: JobId,
    job_type: String,
    payload: serde_json::Value,
}

impl JobEnvelope {
    pub fn new(id: JobId, job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            payload,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}
