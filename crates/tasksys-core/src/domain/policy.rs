//! Per-task policies: uniqueness and chain failure handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniqueness constraint applied by the queue at submission time.
///
/// The key compared is the task's `unique_via` (its type name by default).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UniqueType {
    #[default]
    None,
    /// At most one pending or running task per key.
    Job,
    /// At most one pending task per key; a running one does not block.
    UntilProcessing,
}

/// What a chain does once a child has exhausted its own retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainRetryBehavior {
    #[default]
    StopChain,
    SkipTask,
    /// Child-level retries only; behaves like `StopChain` once they run out.
    RetryTask,
    /// Restart the chain from the first child, bounded by the chain's `max_retries`.
    /// The chain context is kept as-is.
    RetryChain,
}

impl ChainRetryBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopChain => "STOP_CHAIN",
            Self::SkipTask => "SKIP_TASK",
            Self::RetryTask => "RETRY_TASK",
            Self::RetryChain => "RETRY_CHAIN",
        }
    }

    /// Lenient parse used on restore; unknown names fall back to `StopChain`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "SKIP_TASK" => Self::SkipTask,
            "RETRY_TASK" => Self::RetryTask,
            "RETRY_CHAIN" => Self::RetryChain,
            _ => Self::StopChain,
        }
    }
}

impl fmt::Display for ChainRetryBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
