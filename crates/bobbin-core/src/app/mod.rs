//! App - アプリケーション層
//!
//! ports を組み合わせて worker を動かします。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: 設定と handler から engine を組み立てる
//! - **WorkerEngine**: reserve → route → handle → dispose のループ
//! - **EventBus**: `WorkerEvent` の同期配信
//! - **WorkerStatus**: 現在の状態と処理件数のスナップショット

pub mod builder;
pub mod config;
pub mod engine;
pub mod event_bus;
pub mod status;

pub use self::builder::{BuildError, WorkerBuilder};
pub use self::config::{ConfigError, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, WorkerConfig};
pub use self::engine::WorkerEngine;
pub use self::event_bus::EventBus;
pub use self::status::{WorkerCounts, WorkerStatus};
