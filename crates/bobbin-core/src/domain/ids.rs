//! Domain identifiers.
//!
//! ジョブ ID はキューサービス側で採番されるので、ここでは u64 をラップするだけ。
//! 型で包んでおくことで、priority や秒数などの整数と取り違えないようにしています。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tube every connection watches (and uses) when it is opened.
pub const DEFAULT_TUBE: &str = "default";

/// Priority used for bury/release when the reservation did not report one.
///
/// Smaller numbers are more urgent; 1000 sits well below the usual producer
/// priorities so recycled jobs do not jump the queue.
pub const LOWEST_PRIORITY: u32 = 1000;

/// Identifier assigned to a job by the queue service.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
