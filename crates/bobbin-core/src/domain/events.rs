//! Events - the fixed set of notifications a worker publishes.
//!
//! Integrators observe the worker only through these; fatal start failures
//! and non-fatal warnings included.

use std::fmt;

use serde::Serialize;

use super::errors::ProtocolError;
use super::ids::JobId;

/// Non-fatal error detail carried by `WorkerEvent::Warning`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Step that failed, e.g. `"reserve"`, `"decode"`, `"delete"`.
    pub operation: &'static str,
    pub job_id: Option<JobId>,
    pub message: String,
}

impl Warning {
    pub fn new(operation: &'static str, job_id: Option<JobId>, message: impl Into<String>) -> Self {
        Self {
            operation,
            job_id,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job_id {
            Some(id) => write!(f, "{} (job {}): {}", self.operation, id, self.message),
            None => write!(f, "{}: {}", self.operation, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum WorkerEvent {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "stopped")]
    Stopped,
    /// Fatal lifecycle error; the worker did not start.
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "warning")]
    Warning(Warning),
    #[serde(rename = "job.reserved")]
    JobReserved(JobId),
    #[serde(rename = "job.handled")]
    JobHandled(JobId),
    #[serde(rename = "job.deleted")]
    JobDeleted(JobId),
    #[serde(rename = "job.buried")]
    JobBuried(JobId),
    #[serde(rename = "job.released")]
    JobReleased(JobId),
}

impl WorkerEvent {
    pub fn error(err: &ProtocolError) -> Self {
        WorkerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Started => "started",
            WorkerEvent::Stopped => "stopped",
            WorkerEvent::Error { .. } => "error",
            WorkerEvent::Warning(_) => "warning",
            WorkerEvent::JobReserved(_) => "job.reserved",
            WorkerEvent::JobHandled(_) => "job.handled",
            WorkerEvent::JobDeleted(_) => "job.deleted",
            WorkerEvent::JobBuried(_) => "job.buried",
            WorkerEvent::JobReleased(_) => "job.released",
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerEvent::JobReserved(id)
            | WorkerEvent::JobHandled(id)
            | WorkerEvent::JobDeleted(id)
            | WorkerEvent::JobBuried(id)
            | WorkerEvent::JobReleased(id) => Some(*id),
            WorkerEvent::Warning(w) => w.job_id,
            _ => None,
        }
    }

    /// Deleted, buried or released: the job has left this worker.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::JobDeleted(_) | WorkerEvent::JobBuried(_) | WorkerEvent::JobReleased(_)
        )
    }
}
