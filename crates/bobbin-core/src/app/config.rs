//! WorkerConfig - settings a worker is built from.
//!
//! Handlers are not part of the serialisable config; they are registered on
//! the `WorkerBuilder` next to it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reservation timeout used when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Largest reservation timeout the queue protocol can carry (32-bit seconds).
pub const MAX_TIMEOUT_SECS: u64 = u32::MAX as u64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("reservation timeout must be at least one second")]
    ZeroTimeout,

    #[error("reservation timeout {0}s exceeds the maximum of {max}s", max = MAX_TIMEOUT_SECS)]
    TimeoutTooLarge(u64),

    #[error("host must not be empty")]
    EmptyHost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Free-form label used in logs.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Tubes watched when `start` is called without an explicit list.
    pub tubes: Vec<String>,
    /// Stop watching the default tube once explicit tubes are watched.
    #[serde(alias = "ignoreDefault")]
    pub ignore_default: bool,
    /// Seconds a single reserve call may block.
    pub timeout: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            host: "127.0.0.1".to_string(),
            port: 11300,
            tubes: Vec::new(),
            ignore_default: false,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_tubes<I, S>(mut self, tubes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tubes = tubes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ignore_default(mut self, ignore: bool) -> Self {
        self.ignore_default = ignore;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// `host:port`
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::TimeoutTooLarge(self.timeout));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        Ok(())
    }
}
