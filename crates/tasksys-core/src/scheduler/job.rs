use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Trigger;
use crate::domain::{JobId, SerializedTask, TaskId};

/// A persisted schedule entry. Each firing re-materialises `task` into a fresh run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_type: String,
    pub task_name: String,
    pub trigger: Trigger,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub task: SerializedTask,
}

/// Listing view of a job, without the task snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobInfo {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_type: String,
    pub task_name: String,
    pub trigger: Trigger,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&ScheduledJob> for ScheduledJobInfo {
    fn from(job: &ScheduledJob) -> Self {
        Self {
            job_id: job.job_id,
            task_id: job.task_id,
            task_type: job.task_type.clone(),
            task_name: job.task_name.clone(),
            trigger: job.trigger.clone(),
            next_run: job.next_run,
            created_at: job.created_at,
        }
    }
}
