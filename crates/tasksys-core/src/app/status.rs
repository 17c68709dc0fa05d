//! Status - Manager が返す結果型

use crate::domain::{JobId, TaskId, TaskSystemError};

pub use crate::scheduler::ScheduledJobInfo;
pub use crate::tracker::TaskInfo;

/// Where `add_task` put the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSubmission {
    Queued(TaskId),
    Scheduled(JobId),
}

impl TaskSubmission {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Queued(id) => Some(*id),
            Self::Scheduled(_) => None,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Queued(_) => None,
            Self::Scheduled(id) => Some(*id),
        }
    }
}

/// Per-id result of a bulk tag operation.
///
/// `skipped` holds chain children that were filtered out and tasks already in a state
/// where the action is a no-op.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub applied: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
    pub failed: Vec<(TaskId, TaskSystemError)>,
}

impl BulkOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.applied.len() + self.skipped.len() + self.failed.len()
    }
}
