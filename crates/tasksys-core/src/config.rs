//! Config - タスクシステムの設定（TOML）
//!
//! すべてのフィールドにデフォルトがあるため、空のファイルでも読み込めます。
//!
//! ```toml
//! max_concurrent_tasks = 4
//! retry_backoff_multiplier = 2.0
//! storage_path = "data/tasks.json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::queue::{QueueOptions, RetryPolicy};
use crate::tracker::HistoryLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSystemConfig {
    pub max_concurrent_tasks: usize,
    pub failed_history_limit: usize,
    pub completed_history_limit: usize,
    pub pause_poll_interval_ms: u64,
    /// 1.0 = fixed delay; above 1.0 the delay grows per attempt.
    pub retry_backoff_multiplier: f64,
    pub storage_path: PathBuf,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            failed_history_limit: 1000,
            completed_history_limit: 1000,
            pause_poll_interval_ms: 500,
            retry_backoff_multiplier: 1.0,
            storage_path: PathBuf::from("config/task_storage.json"),
        }
    }
}

impl TaskSystemConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            failed: self.failed_history_limit,
            completed: self.completed_history_limit,
        }
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_concurrent: self.max_concurrent_tasks,
            retry: RetryPolicy::new(self.retry_backoff_multiplier),
            pause_poll_interval: Duration::from_millis(self.pause_poll_interval_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_gives_defaults() {
        let config = TaskSystemConfig::from_toml_str("").unwrap();
        assert_eq!(config, TaskSystemConfig::default());
        assert_eq!(config.queue_options().max_concurrent, 3);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let config = TaskSystemConfig::from_toml_str(
            "max_concurrent_tasks = 8\nretry_backoff_multiplier = 2.0\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.retry_backoff_multiplier, 2.0);
        assert_eq!(config.failed_history_limit, 1000);
        assert_eq!(config.storage_path, PathBuf::from("config/task_storage.json"));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "pause_poll_interval_ms = 50").unwrap();

        let config = TaskSystemConfig::from_file(&path).unwrap();
        assert_eq!(config.queue_options().pause_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn bad_documents_are_reported() {
        assert!(matches!(
            TaskSystemConfig::from_toml_str("max_concurrent_tasks = \"three\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            TaskSystemConfig::from_file("/nonexistent/tasks.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
