//! KvStore port - 永続化ストアの抽象化
//!
//! 永続化されるのは JSON 互換の値のみ（mapping / sequence / string / number / bool）。
//! 使用するキー:
//! - `failedTaskHistory`, `completedTaskHistory`: Tracker
//! - `pendingTasks`: Queue
//! - `scheduledJobs`: Scheduler

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key-value store backing all persisted task-system state.
///
/// # Thread Safety
/// Called from worker threads (failure history) and the control plane alike.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Force buffered writes to durable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn get_or(&self, key: &str, default: Value) -> Result<Value, StoreError> {
        Ok(self.get(key)?.unwrap_or(default))
    }
}
