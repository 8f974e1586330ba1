//! Demo handlers registered by the `bobbin` binary.

use std::time::Duration;

use async_trait::async_trait;
use bobbin_core::domain::HandlerResult;
use bobbin_core::typed::{Handler, HandlerError, Job, JobContext};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Reverse the order of the words, then answer with `trigger`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Reverse {
    pub words: String,
    /// `success`, `bury`, or anything else to release.
    #[serde(default)]
    pub trigger: Option<String>,
    /// Release delay in seconds.
    #[serde(default)]
    pub delay: Option<u64>,
}

impl Job for Reverse {
    const TYPE: &'static str = "reverse";
}

pub struct ReverseHandler;

pub fn reverse_words(input: &str) -> String {
    input.split(' ').rev().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Handler<Reverse> for ReverseHandler {
    async fn handle(&self, ctx: JobContext, job: Reverse) -> Result<HandlerResult, HandlerError> {
        info!(job_id = %ctx.job_id(), result = %reverse_words(&job.words), "reversed");
        let trigger = job.trigger.as_deref().unwrap_or("success");
        Ok(HandlerResult::from_tag(trigger, job.delay.map(Duration::from_secs)))
    }
}

/// Sleep for `millis`, touching the job every `touch_every` milliseconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
    #[serde(default)]
    pub touch_every: Option<u64>,
}

impl Job for Sleep {
    const TYPE: &'static str = "sleep";
}

pub struct SleepHandler;

#[async_trait]
impl Handler<Sleep> for SleepHandler {
    async fn handle(&self, ctx: JobContext, job: Sleep) -> Result<HandlerResult, HandlerError> {
        let total = Duration::from_millis(job.millis);
        // a zero interval would never advance
        let step = job
            .touch_every
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or(total);
        let mut slept = Duration::ZERO;

        while slept < total {
            let chunk = step.min(total - slept);
            tokio::time::sleep(chunk).await;
            slept += chunk;
            if slept < total {
                ctx.touch()
                    .await
                    .map_err(|e| HandlerError::failed(format!("touch: {e}")))?;
            }
        }

        info!(job_id = %ctx.job_id(), millis = job.millis, "slept");
        Ok(HandlerResult::success())
    }
}
