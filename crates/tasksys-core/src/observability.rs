use serde::{Deserialize, Serialize};

/// Point-in-time counts of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub max_concurrent: usize,
    /// Failed tasks waiting on their retry timer.
    pub retrying: usize,
}
