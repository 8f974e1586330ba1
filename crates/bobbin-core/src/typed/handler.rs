//! Handler traits - Job を実行する Handler の定義
//!
//! - `Handler<T>`: payload を型 T にデコードしてから受け取る
//! - `DynHandler`: object-safe 版。registry にはこちらが入る
//! - `TypedHandler<T, H>`: `Handler<T>` を `DynHandler` に型消去するアダプタ
//!
//! Handler の future が完了すること自体が「完了通知」であり、
//! 1 ジョブにつき必ず 1 回だけ `HandlerResult` が返ります。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::job::Job;
use crate::domain::{HandlerResult, JobId, ProtocolError};
use crate::ports::{JobStats, QueueClient};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("payload decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Per-job handle given to a handler.
///
/// Long-running handlers use it to extend their own lease; the worker never
/// touches jobs on their behalf.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    client: Arc<dyn QueueClient>,
}

impl JobContext {
    pub fn new(job_id: JobId, client: Arc<dyn QueueClient>) -> Self {
        Self { job_id, client }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn touch(&self) -> Result<(), ProtocolError> {
        self.client.touch(self.job_id).await
    }

    pub async fn stats(&self) -> Result<JobStats, ProtocolError> {
        self.client.stats_job(self.job_id).await
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }
}

/// Handles one job type with a decoded payload.
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<Resize> for ResizeHandler {
///     async fn handle(&self, ctx: JobContext, job: Resize) -> Result<HandlerResult, HandlerError> {
///         resize(&job.url, job.width).await?;
///         Ok(HandlerResult::success())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Job>: Send + Sync {
    async fn handle(&self, ctx: JobContext, job: T) -> Result<HandlerResult, HandlerError>;
}

/// Object-safe handler over the raw JSON payload.
///
/// Implement this directly when the payload has no fixed shape.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> Result<HandlerResult, HandlerError>;
}

pub struct TypedHandler<T: Job, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Job, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Job, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> Result<HandlerResult, HandlerError> {
        let job: T = serde_json::from_value(payload)?;
        self.handler.handle(ctx, job).await
    }
}
