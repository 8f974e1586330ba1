//! bobbin-core
//!
//! Building blocks for a job worker on a tube-based work queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, outcome, state, events, errors）
//! - **ports**: 抽象化レイヤー（QueueClient, EventSink）
//! - **typed**: 型付き Job API（Job trait, Handler trait, HandlerRegistry, codec）
//! - **app**: アプリケーションロジック（builder, engine, event_bus, status, config）
//! - **impls**: 実装（InMemoryServer など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{EventBus, WorkerBuilder, WorkerConfig, WorkerEngine, WorkerStatus};
pub use domain::{HandlerResult, JobId, WorkerEvent, WorkerState};
