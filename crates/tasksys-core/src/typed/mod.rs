//! Typed - 型付き Task API
//!
//! タスク型名の typo を型で排除し、スナップショットからの復元を静的に登録します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait - 型安全、serde derive でフィールドを宣言
//! - **内部（Dyn）**: `DynTask` trait - object-safe, type erasure

pub mod body;
pub mod registry;
pub mod task;

pub use self::body::{DynTask, TypedTask};
pub use self::registry::{RegistryError, TaskFactory, TaskRegistry};
pub use self::task::Task;
