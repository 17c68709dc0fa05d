//! App - アプリケーション層
//!
//! # 主要コンポーネント
//! - **TaskSystemBuilder**: 構築とワイヤリング、起動時検証
//! - **TaskManager**: 外部向けの facade（投入・キャンセル・一時停止・一括操作・状態の保存/復元）

pub mod builder;
pub mod manager;
pub mod status;

pub use self::builder::{BuildError, TaskSystemBuilder};
pub use self::manager::TaskManager;
pub use self::status::{BulkOutcome, ScheduledJobInfo, TaskInfo, TaskSubmission};
