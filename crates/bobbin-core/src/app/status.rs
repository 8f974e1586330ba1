//! Status - what a worker is doing right now, and what it has done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, WorkerEvent, WorkerState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub reserved: u64,
    pub handled: u64,
    pub deleted: u64,
    pub buried: u64,
    pub released: u64,
    pub warnings: u64,
}

impl WorkerCounts {
    pub fn record(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::JobReserved(_) => self.reserved += 1,
            WorkerEvent::JobHandled(_) => self.handled += 1,
            WorkerEvent::JobDeleted(_) => self.deleted += 1,
            WorkerEvent::JobBuried(_) => self.buried += 1,
            WorkerEvent::JobReleased(_) => self.released += 1,
            WorkerEvent::Warning(_) => self.warnings += 1,
            WorkerEvent::Started | WorkerEvent::Stopped | WorkerEvent::Error { .. } => {}
        }
    }

    /// Jobs that reached delete, bury or release.
    pub fn settled(&self) -> u64 {
        self.deleted + self.buried + self.released
    }
}

/// Snapshot returned by `WorkerEngine::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub state: WorkerState,
    /// Job between `job.reserved` and its disposition, if any.
    pub current_job: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub counts: WorkerCounts,
}

impl WorkerStatus {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: WorkerState::Idle,
            current_job: None,
            started_at: None,
            counts: WorkerCounts::default(),
        }
    }

    /// Fold one published event into the snapshot.
    pub fn record(&mut self, event: &WorkerEvent) {
        self.counts.record(event);
        match event {
            WorkerEvent::Started => self.started_at = Some(Utc::now()),
            WorkerEvent::JobReserved(id) => self.current_job = Some(*id),
            e if e.is_terminal() => self.current_job = None,
            _ => {}
        }
    }
}
