//! Handler outcome model.
//!
//! A handler finishes a job by returning exactly one `HandlerResult`.
//! The engine turns it into a `Disposition` against the queue service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the handler wants done with its job.
///
/// Serialized as `{"action": "success"}`, `{"action": "bury"}` or
/// `{"action": "release", "delay": 5}` (delay in seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HandlerResult {
    /// Work finished; the job is deleted.
    Success,

    /// Keep the job out of rotation for manual inspection.
    Bury,

    /// Hand the job back to the ready queue, optionally after a delay.
    Release {
        #[serde(default, with = "delay_secs")]
        delay: Duration,
    },
}

impl HandlerResult {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn bury() -> Self {
        Self::Bury
    }

    pub fn release(delay: Duration) -> Self {
        Self::Release { delay }
    }

    /// Map a legacy string outcome onto the closed set.
    ///
    /// `"success"` and `"bury"` are recognised; every other tag releases the
    /// job, using `delay` when given.
    pub fn from_tag(tag: &str, delay: Option<Duration>) -> Self {
        match tag {
            "success" => Self::Success,
            "bury" => Self::Bury,
            _ => Self::Release {
                delay: delay.unwrap_or(Duration::ZERO),
            },
        }
    }

    pub fn disposition(&self) -> Disposition {
        match *self {
            Self::Success => Disposition::Delete,
            Self::Bury => Disposition::Bury,
            Self::Release { delay } => Disposition::Release { delay },
        }
    }
}

/// Terminal command applied to a reserved job. Exactly one per reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delete,
    Bury,
    Release { delay: Duration },
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Delete => "delete",
            Disposition::Bury => "bury",
            Disposition::Release { .. } => "release",
        }
    }
}

mod delay_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delay: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(delay.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
