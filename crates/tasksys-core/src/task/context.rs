use serde::Serialize;
use std::time::Duration;

use super::handle::TaskHandle;
use crate::chain::ChainContext;
use crate::domain::{TaskFailure, TaskId};

/// What a task body sees while it runs.
///
/// Long-running bodies must call [`TaskContext::checkpoint`] (or both `check_paused` and
/// `is_cancelled`) at reasonable intervals; cancellation and pause have no effect between
/// poll points.
pub struct TaskContext {
    task: TaskHandle,
}

impl TaskContext {
    pub(crate) fn new(task: TaskHandle) -> Self {
        Self { task }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn name(&self) -> String {
        self.task.name()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// `Err(TaskFailure::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), TaskFailure> {
        if self.task.is_cancelled() {
            Err(TaskFailure::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block while paused. Wakes on resume or cancellation.
    pub fn check_paused(&self) {
        self.task.check_paused();
    }

    pub fn checkpoint(&self) -> Result<(), TaskFailure> {
        self.task.check_paused();
        self.check_cancelled()
    }

    pub fn set_progress(&self, value: i64) {
        self.task.set_progress(value);
    }

    pub fn set_result(&self, result: impl Serialize) -> Result<(), TaskFailure> {
        self.task.set_result(serde_json::to_value(result)?);
        Ok(())
    }

    /// Mark the run as failed without returning an error.
    pub fn fail(&self, reason: impl Into<String>) {
        self.task.fail(reason);
    }

    /// Sleep that returns `Err(TaskFailure::Cancelled)` as soon as the task is cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskFailure> {
        if self.task.sleep(duration) {
            Ok(())
        } else {
            Err(TaskFailure::Cancelled)
        }
    }

    /// Shared context of the owning chain, if this task runs inside one.
    pub fn chain_context(&self) -> Option<ChainContext> {
        self.task.chain_context()
    }

    pub fn task(&self) -> &TaskHandle {
        &self.task
    }
}
