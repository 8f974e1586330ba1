//! QueueClient port - the work-queue service as seen from one connection.
//!
//! 各メソッドはプロトコルのコマンド 1 つに対応します。
//! 成功すれば型付きの結果、失敗すれば名前付きのエラーコード（`ProtocolError`）を返す。
//!
//! # 実装
//! - `impls::memory::InMemoryClient`: 開発・テスト用
//! - TCP wire client: このクレートの対象外

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, ProtocolError};

/// A job handed out by `reserve_with_timeout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub id: JobId,
    /// Priority the job was stored with, when the client knows it.
    pub priority: Option<u32>,
    pub body: Vec<u8>,
}

/// A job returned by one of the peek commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekedJob {
    pub id: JobId,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStateKind {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

/// Result of `stats-job`. Durations are reported in whole seconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStats {
    pub id: JobId,
    pub tube: String,
    pub state: JobStateKind,
    pub pri: u32,
    pub age: u64,
    pub delay: u64,
    pub ttr: u64,
    /// Seconds until a reservation expires or a delay elapses.
    pub time_left: u64,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
}

/// One connection to the queue service.
///
/// Methods take `&self` so the connection can be shared (`Arc<dyn QueueClient>`)
/// between the engine and handlers that need to `touch` their job.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Human readable `host:port` of the service.
    fn target(&self) -> String;

    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Close the connection. Jobs still reserved by it go back to ready.
    async fn quit(&self) -> Result<(), ProtocolError>;

    /// Select the tube `put` and the peek commands operate on.
    async fn use_tube(&self, tube: &str) -> Result<String, ProtocolError>;

    /// Add a tube to the watch list; returns the number of watched tubes.
    async fn watch(&self, tube: &str) -> Result<usize, ProtocolError>;

    /// Remove a tube from the watch list; returns the number of watched tubes.
    async fn ignore(&self, tube: &str) -> Result<usize, ProtocolError>;

    async fn list_tubes_watched(&self) -> Result<Vec<String>, ProtocolError>;

    async fn put(
        &self,
        priority: u32,
        delay: Duration,
        ttr: Duration,
        body: Vec<u8>,
    ) -> Result<JobId, ProtocolError>;

    /// Reserve the next ready job from a watched tube.
    ///
    /// `Ok(None)` means nothing became available within `timeout`.
    async fn reserve_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<ReservedJob>, ProtocolError>;

    async fn delete(&self, id: JobId) -> Result<(), ProtocolError>;

    async fn bury(&self, id: JobId, priority: u32) -> Result<(), ProtocolError>;

    async fn release(&self, id: JobId, priority: u32, delay: Duration)
    -> Result<(), ProtocolError>;

    /// Reset the remaining time-to-run of a job reserved by this connection.
    async fn touch(&self, id: JobId) -> Result<(), ProtocolError>;

    async fn peek_ready(&self) -> Result<PeekedJob, ProtocolError>;

    async fn peek_buried(&self) -> Result<PeekedJob, ProtocolError>;

    async fn stats_job(&self, id: JobId) -> Result<JobStats, ProtocolError>;
}
