//! Ports - 抽象化レイヤー
//!
//! engine が外部に求めるものを trait として定義します。
//! - `QueueClient`: キューサービスへの 1 接続
//! - `EventSink`: `WorkerEvent` の受け手

pub mod event_sink;
pub mod queue_client;

pub use self::event_sink::{ChannelSink, EventSink};
pub use self::queue_client::{JobStateKind, JobStats, PeekedJob, QueueClient, ReservedJob};
