//! Task trait - 型付きタスク本体の定義
//!
//! # Trait Bounds
//! - `Serialize`: 永続化（スナップショット）のため。derive されたフィールドがそのまま
//!   シリアライズ対象の宣言になる（`#[serde(skip)]` のフィールドは保存されない）
//! - `DeserializeOwned`: 再起動後の復元のため
//! - `Send + Sync + 'static`: ワーカースレッド間で共有するため

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskFailure;
use crate::task::TaskContext;

/// 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct FetchTask {
///     url: String,
/// }
///
/// impl Task for FetchTask {
///     const TYPE: &'static str = "FetchTask";
///
///     fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
///         for step in 0..10 {
///             ctx.checkpoint()?;
///             ctx.set_progress(step * 10);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type discriminator stored in snapshots; also the automatic tag.
    const TYPE: &'static str;

    /// The work itself. Runs on a worker thread and may block.
    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure>;

    /// Release external resources (child processes, connections) after cancellation.
    ///
    /// Called at most once, from the cancelling thread, possibly while `handle` is still running.
    fn cleanup(&self) {}
}
