//! Errors - エラー型と分類
//!
//! - [`TaskSystemError`]: Manager / Tracker / Queue / Scheduler の操作エラー（呼び出し側へ伝播する）
//! - [`TaskFailure`]: タスク本体 (`handle`) が返す実行エラー（`run()` の境界で FAILED に変換され、伝播しない）

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::{JobId, TaskId};
use crate::domain::status::TaskStatus;
use crate::ports::store::StoreError;

#[derive(Debug, Error)]
pub enum TaskSystemError {
    #[error("Task with id '{0}' not found")]
    TaskNotFound(TaskId),

    #[error("Cannot perform '{operation}' on task '{task_id}' in state '{current}'")]
    InvalidTaskState {
        task_id: TaskId,
        current: TaskStatus,
        operation: &'static str,
    },

    #[error("Task '{0}' was cancelled")]
    TaskCancelled(TaskId),

    #[error("Task '{task_id}' violates uniqueness of key '{unique_key}'")]
    UniqueViolation { task_id: TaskId, unique_key: String },

    #[error("Task '{0}' is already queued")]
    AlreadyQueued(TaskId),

    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("Scheduled job '{0}' not found")]
    JobNotFound(JobId),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Task system is shut down")]
    ShutDown,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Structured detail of a body-level failure.
///
/// `kind` は元の例外型名に相当する分類（"TaskFailure", "IoError" など）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// A permanent failure is never retried by the queue.
    #[serde(default)]
    pub permanent: bool,
}

/// Error type returned by a task body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskFailure {
    #[error("{}: {}", .0.kind, .0.message)]
    Failed(FailureDetail),

    /// Exception-style cancellation unwinding; finalizes as CANCELLED.
    #[error("task was cancelled")]
    Cancelled,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind("TaskFailure", message)
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed(FailureDetail {
            kind: kind.into(),
            message: message.into(),
            code: None,
            permanent: false,
        })
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed(FailureDetail {
            kind: "PermanentTaskFailure".to_string(),
            message: message.into(),
            code: Some(code.into()),
            permanent: true,
        })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Failed(detail) if detail.permanent)
    }
}

impl From<std::io::Error> for TaskFailure {
    fn from(e: std::io::Error) -> Self {
        Self::with_kind("IoError", e.to_string())
    }
}

impl From<serde_json::Error> for TaskFailure {
    fn from(e: serde_json::Error) -> Self {
        Self::with_kind("SerializationError", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_task_and_state() {
        let id = TaskId::generate();
        let err = TaskSystemError::InvalidTaskState {
            task_id: id,
            current: TaskStatus::Pending,
            operation: "pause",
        };
        assert_eq!(
            err.to_string(),
            format!("Cannot perform 'pause' on task '{id}' in state 'PENDING'")
        );
        assert_eq!(
            TaskSystemError::TaskNotFound(id).to_string(),
            format!("Task with id '{id}' not found")
        );
    }

    #[test]
    fn failure_display_includes_kind() {
        let failure = TaskFailure::with_kind("ValueError", "bad input");
        assert_eq!(failure.to_string(), "ValueError: bad input");
        assert!(!failure.is_permanent());
    }

    #[test]
    fn permanent_failure_carries_code() {
        let failure = TaskFailure::permanent("E_AUTH", "credentials rejected");
        assert!(failure.is_permanent());
        let TaskFailure::Failed(detail) = failure else {
            panic!("expected Failed");
        };
        assert_eq!(detail.code.as_deref(), Some("E_AUTH"));
    }
}
