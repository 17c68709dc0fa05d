//! Events - イベントバス上を流れるイベント
//!
//! 出力イベント（task-added など）と入力イベント（task-request, chain-progress-update-request）を
//! 1 つの enum で表現します。購読は [`EventKind`] 単位、または全イベント（global）です。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::domain::ids::{JobId, TaskId};
use crate::domain::status::TaskStatus;
use crate::observability::QueueStatus;
use crate::scheduler::Trigger;
use crate::task::TaskHandle;

/// Error payload of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskAdded {
        task_id: TaskId,
    },
    TaskRemoved {
        task_id: TaskId,
    },
    TaskStatusUpdated {
        task_id: TaskId,
        status: TaskStatus,
    },
    TaskProgressUpdated {
        task_id: TaskId,
        progress: u8,
    },
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<ErrorInfo>,
    },
    TaskQueued {
        task_id: TaskId,
    },
    TaskDequeued {
        task_id: TaskId,
    },
    FailedTaskLogged {
        record: Value,
    },
    QueueStatusChanged(QueueStatus),
    JobScheduled {
        job_id: JobId,
        task_id: TaskId,
    },
    JobUnscheduled {
        job_id: JobId,
    },
    JobExecuted {
        job_id: JobId,
        task_id: TaskId,
    },
    SystemReady,

    /// Inbound: submit a task without a direct call to the manager.
    TaskRequest {
        task: TaskHandle,
        schedule: Option<Trigger>,
    },
    /// Inbound: out-of-band progress for a running chain. Values outside 0..=100 are ignored.
    ChainProgressUpdateRequest {
        chain_id: TaskId,
        progress: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskAdded,
    TaskRemoved,
    TaskStatusUpdated,
    TaskProgressUpdated,
    TaskFinished,
    TaskQueued,
    TaskDequeued,
    FailedTaskLogged,
    QueueStatusChanged,
    JobScheduled,
    JobUnscheduled,
    JobExecuted,
    SystemReady,
    TaskRequest,
    ChainProgressUpdateRequest,
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskAdded { .. } => EventKind::TaskAdded,
            Self::TaskRemoved { .. } => EventKind::TaskRemoved,
            Self::TaskStatusUpdated { .. } => EventKind::TaskStatusUpdated,
            Self::TaskProgressUpdated { .. } => EventKind::TaskProgressUpdated,
            Self::TaskFinished { .. } => EventKind::TaskFinished,
            Self::TaskQueued { .. } => EventKind::TaskQueued,
            Self::TaskDequeued { .. } => EventKind::TaskDequeued,
            Self::FailedTaskLogged { .. } => EventKind::FailedTaskLogged,
            Self::QueueStatusChanged(_) => EventKind::QueueStatusChanged,
            Self::JobScheduled { .. } => EventKind::JobScheduled,
            Self::JobUnscheduled { .. } => EventKind::JobUnscheduled,
            Self::JobExecuted { .. } => EventKind::JobExecuted,
            Self::SystemReady => EventKind::SystemReady,
            Self::TaskRequest { .. } => EventKind::TaskRequest,
            Self::ChainProgressUpdateRequest { .. } => EventKind::ChainProgressUpdateRequest,
        }
    }
}

impl EventKind {
    /// Conventional event name on the bus.
    pub fn name(self) -> &'static str {
        match self {
            Self::TaskAdded => "task-added",
            Self::TaskRemoved => "task-removed",
            Self::TaskStatusUpdated => "task-status-updated",
            Self::TaskProgressUpdated => "task-progress-updated",
            Self::TaskFinished => "task-finished",
            Self::TaskQueued => "task-queued",
            Self::TaskDequeued => "task-dequeued",
            Self::FailedTaskLogged => "failed-task-logged",
            Self::QueueStatusChanged => "queue-status-changed",
            Self::JobScheduled => "job-scheduled",
            Self::JobUnscheduled => "job-unscheduled",
            Self::JobExecuted => "job-executed",
            Self::SystemReady => "system-ready",
            Self::TaskRequest => "TaskRequest",
            Self::ChainProgressUpdateRequest => "ChainProgressUpdateRequest",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
