//! DynTask - 型消去された runnable
//!
//! `TypedTask<T>` が `Task` を `DynTask` に変換し、`TaskHandle` は `Box<dyn DynTask>` を保持します。
//! チェーン（[`TaskChain`]）は serde で表現できない子タスクを持つため、`DynTask` を直接実装します。

use serde_json::Value;
use std::any::Any;

use super::task::Task;
use crate::chain::TaskChain;
use crate::domain::TaskFailure;
use crate::task::TaskContext;

/// Object-safe runnable interface.
pub trait DynTask: Send + Sync {
    fn type_name(&self) -> &str;

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure>;

    fn cleanup(&self);

    /// Type-specific fields of the snapshot.
    fn fields(&self) -> Result<Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;

    fn as_chain(&self) -> Option<&TaskChain> {
        None
    }
}

pub struct TypedTask<T: Task> {
    task: T,
}

impl<T: Task> TypedTask<T> {
    pub fn new(task: T) -> Self {
        Self { task }
    }
}

impl<T: Task> DynTask for TypedTask<T> {
    fn type_name(&self) -> &str {
        T::TYPE
    }

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        self.task.handle(ctx)
    }

    fn cleanup(&self) {
        self.task.cleanup();
    }

    fn fields(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.task)
    }

    fn as_any(&self) -> &dyn Any {
        &self.task
    }
}
