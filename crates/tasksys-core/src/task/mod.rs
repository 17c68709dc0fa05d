//! Task - 実行単位
//!
//! - [`TaskHandle`]: タスク実体（状態・キャンセル・一時停止・シリアライズ）
//! - [`TaskContext`]: 本体 (`handle`) に渡される協調ポイント
//! - [`TaskOptions`]: 生成時の設定

pub mod context;
mod gate;
pub mod handle;
pub mod options;

pub use self::context::TaskContext;
pub use self::handle::{CHAIN_CHILD_TAG, TaskHandle, WeakTaskHandle, parent_tag};
pub use self::options::TaskOptions;
