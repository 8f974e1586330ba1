//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryServer / InMemoryClient**: プロセス内で動くキューサービス
//!
//! ネットワーク越しのクライアントは別クレートに置く想定です。

pub mod memory;

pub use self::memory::{InMemoryClient, InMemoryServer};
