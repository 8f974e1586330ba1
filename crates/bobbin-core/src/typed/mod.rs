//! Typed - 型付き Job API
//!
//! job type の typo を型で排除し、Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Job` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod codec;
pub mod handler;
pub mod job;
pub mod registry;

pub use self::codec::{CodecError, EnvelopeBody, WireEnvelope};
pub use self::handler::{DynHandler, Handler, HandlerError, JobContext, TypedHandler};
pub use self::job::Job;
pub use self::registry::{HandlerRegistry, RegistryError};
