//! Worker lifecycle state.

use serde::{Deserialize, Serialize};

/// State of one worker engine.
///
/// State transitions:
/// - Idle -> Connecting -> Watching -> Reserving
/// - Reserving <-> Processing
/// - any -> Stopping -> Stopped
/// - Connecting -> Idle (connection refused)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Connecting,
    Watching,
    Reserving,
    Processing,
    Stopping,
    Stopped,
}

impl WorkerState {
    /// Stop has been requested or has completed.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, WorkerState::Stopping | WorkerState::Stopped)
    }

    /// The reservation loop owns the connection.
    pub fn is_running(self) -> bool {
        matches!(self, WorkerState::Reserving | WorkerState::Processing)
    }
}
