//! Errors - protocol error codes and engine lifecycle errors.

use thiserror::Error;

/// A failed queue-service command, identified by a named error code.
///
/// The codes follow the queue protocol's response words, plus `ECONNREFUSED`
/// for a connection that could not be established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("not connected")]
    NotConnected,

    /// No job became available within the reservation timeout.
    #[error("reservation timed out")]
    TimedOut,

    #[error("job or tube not found")]
    NotFound,

    /// Attempted to ignore the last watched tube.
    #[error("cannot ignore the only watched tube")]
    NotIgnored,

    #[error("bad format: {0}")]
    BadFormat(String),

    /// Any other error word the server answered with.
    #[error("{code}: {message}")]
    Server { code: String, message: String },
}

impl ProtocolError {
    pub fn code(&self) -> &str {
        match self {
            ProtocolError::ConnectionRefused(_) => "ECONNREFUSED",
            ProtocolError::NotConnected => "NOT_CONNECTED",
            ProtocolError::TimedOut => "TIMED_OUT",
            ProtocolError::NotFound => "NOT_FOUND",
            ProtocolError::NotIgnored => "NOT_IGNORED",
            ProtocolError::BadFormat(_) => "BAD_FORMAT",
            ProtocolError::Server { code, .. } => code,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::TimedOut)
    }
}

/// Engine lifecycle errors returned from `start`.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: ProtocolError,
    },

    #[error("worker has already been started")]
    AlreadyStarted,
}
