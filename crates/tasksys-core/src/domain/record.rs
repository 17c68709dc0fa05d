//! SerializedTask - 永続化用のタスクスナップショット
//!
//! 共通フィールドは固定のキー、タスク型固有のフィールドは `fields` に入ります。
//! `type` が復元時の discriminator です（[`crate::typed::TaskRegistry`] で解決）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::domain::ids::TaskId;
use crate::domain::policy::UniqueType;
use crate::domain::status::TaskStatus;

pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Shortest retry delay a task may carry.
pub(crate) const MIN_RETRY_DELAY_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_detail: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_persistent: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub current_retry_attempts: u32,
    #[serde(default = "default_fail_silently")]
    pub fail_silently: bool,
    #[serde(default)]
    pub unique_type: UniqueType,
    #[serde(default)]
    pub unique_via: Option<String>,
    #[serde(default)]
    pub chain_id: Option<TaskId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub fields: Value,
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_fail_silently() -> bool {
    true
}

impl SerializedTask {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_optional_keys_take_defaults() {
        let id = TaskId::generate();
        let record = SerializedTask::from_value(json!({
            "id": id,
            "type": "SimpleDemoTask",
            "name": "demo",
            "status": "PENDING",
            "createdAt": "2025-01-01T00:00:00Z",
        }))
        .unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert!(record.fail_silently);
        assert_eq!(record.unique_type, UniqueType::None);
        assert!(record.tags.is_empty());
        assert_eq!(record.fields, Value::Null);
    }

    #[test]
    fn uses_camel_case_keys() {
        let record = SerializedTask::from_value(json!({
            "id": TaskId::generate(),
            "type": "X",
            "name": "x",
            "status": "FAILED",
            "createdAt": "2025-01-01T00:00:00Z",
            "maxRetries": 3,
            "currentRetryAttempts": 2,
            "isPersistent": true,
        }))
        .unwrap();
        let value = record.to_value().unwrap();
        assert_eq!(value["maxRetries"], 3);
        assert_eq!(value["currentRetryAttempts"], 2);
        assert_eq!(value["isPersistent"], true);
        assert_eq!(value["type"], "X");
    }
}
