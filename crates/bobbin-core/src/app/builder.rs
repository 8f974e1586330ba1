//! WorkerBuilder - engine の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定値と handler の揃い具合を build 時に確認

use std::sync::Arc;

use super::config::{ConfigError, WorkerConfig};
use super::engine::WorkerEngine;
use super::event_bus::EventBus;
use crate::ports::QueueClient;
use crate::typed::{DynHandler, Handler, HandlerRegistry, Job, RegistryError};

/// WorkerBuilder は WorkerEngine を構築
///
/// # 使用例
/// ```ignore
/// let engine = WorkerBuilder::new(config)
///     .register::<Resize, _>(ResizeHandler)?
///     .expect_types(&["resize"])
///     .build(Arc::new(client))?;
/// engine.start(&["images"]).await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_types() で期待される job type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: HandlerRegistry,
    expected_types: Option<Vec<String>>,
    events: Option<Arc<EventBus>>,
}

/// BuildError は engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing job types: {0:?}. These types were expected but not registered.")]
    MissingJobTypes(Vec<String>),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            expected_types: None,
            events: None,
        }
    }

    /// 型付き Handler を `T::TYPE` で登録
    pub fn register<T: Job, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// payload をそのまま受け取る Handler を任意の tag で登録
    pub fn handler(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.insert(job_type, handler)?;
        Ok(self)
    }

    pub fn expect_types(mut self, job_types: &[&str]) -> Self {
        self.expected_types = Some(job_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// 既存の EventBus を共有する（listener を build 前に登録したい場合）
    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// # 検証
    /// - `WorkerConfig::validate()`
    /// - expect_types() の job type が全て登録されているか
    pub fn build(self, client: Arc<dyn QueueClient>) -> Result<Arc<WorkerEngine>, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_types {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }

        let events = self.events.unwrap_or_default();
        Ok(Arc::new(WorkerEngine::new(
            self.config,
            self.registry,
            client,
            events,
        )))
    }
}
