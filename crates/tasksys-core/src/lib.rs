//! tasksys-core
//!
//! プロセス内タスクエンジン: 同時実行数を制限したキュー、永続化スケジュール、
//! 進捗・状態の追跡、リトライ、協調的キャンセル、一時停止/再開、共有コンテキスト付きチェーン、
//! タグによる一括操作。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, policy, record, events, errors）
//! - **ports**: 外部コラボレーター（KvStore, Clock）
//! - **impls**: 実装（EventBus, JsonFileStore, InMemoryStore）
//! - **typed**: 型付き Task API（Task trait, DynTask, TaskRegistry）
//! - **task**: タスク実体（TaskHandle, TaskContext, TaskOptions）
//! - **chain**: TaskChain と ChainContext
//! - **tracker**: アクティブタスクのレジストリ、タグ索引、履歴
//! - **queue**: ディスパッチャとリトライ
//! - **scheduler**: date / interval / cron トリガー
//! - **app**: TaskManager（facade）と TaskSystemBuilder
//! - **config**: TOML 設定

pub mod app;
pub mod chain;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod tracker;
pub mod typed;

mod sync;

#[cfg(test)]
mod testing;

pub use app::{BuildError, BulkOutcome, TaskManager, TaskSubmission, TaskSystemBuilder};
pub use chain::{ChainContext, ChainPolicy, TaskChain};
pub use config::TaskSystemConfig;
pub use domain::{
    ChainRetryBehavior, EventKind, JobId, TaskEvent, TaskFailure, TaskId, TaskStatus, TaskSystemError, UniqueType,
};
pub use impls::{EventBus, InMemoryStore, JsonFileStore};
pub use scheduler::Trigger;
pub use task::{TaskContext, TaskHandle, TaskOptions};
pub use typed::{Task, TaskRegistry};
