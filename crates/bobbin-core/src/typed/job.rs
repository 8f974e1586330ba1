//! Job trait - 型付き Job の定義
//!
//! Payload の型と job type タグを結びつけます。

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Binds a payload struct to the type tag producers put in the envelope.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     url: String,
///     width: u32,
/// }
///
/// impl Job for Resize {
///     const TYPE: &'static str = "resize";
/// }
/// ```
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
