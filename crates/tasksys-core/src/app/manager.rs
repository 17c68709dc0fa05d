//! TaskManager - タスクシステムの窓口（facade）
//!
//! Queue / Scheduler / Tracker を束ね、外部からの操作はすべてここを通します。
//! コンポーネントは同じ [`EventBus`] に発行するため、バス上のイベントがそのまま公開契約になります。
//!
//! # 一括操作
//! タグで対象を引き、チェーンの子タスク（`_ChainedChild`）は明示的に含めない限り除外する。
//! 1 件の失敗で全体を止めず、id ごとの結果を [`BulkOutcome`] で返す。

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use super::status::{BulkOutcome, TaskSubmission};
use crate::chain::{ChainPolicy, TaskChain};
use crate::domain::{EventKind, JobId, TaskEvent, TaskId, TaskStatus, TaskSystemError};
use crate::impls::{EventBus, SubscriptionId};
use crate::observability::QueueStatus;
use crate::queue::TaskQueue;
use crate::scheduler::{ScheduledJobInfo, TaskScheduler, Trigger};
use crate::sync::lock;
use crate::task::{TaskHandle, TaskOptions};
use crate::tracker::{TaskInfo, Tracker};
use crate::typed::TaskRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkAction {
    Cancel,
    Pause,
    Resume,
}

impl BulkAction {
    fn name(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

/// Cheap to clone; all clones drive the same system.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    tracker: Arc<Tracker>,
    queue: TaskQueue,
    scheduler: TaskScheduler,
    registry: Arc<TaskRegistry>,
    bus: EventBus,
    request_subscription: Mutex<Option<SubscriptionId>>,
    shut_down: AtomicBool,
}

impl TaskManager {
    /// Wire the components together and start listening for `TaskRequest` events.
    pub fn new(
        tracker: Arc<Tracker>,
        queue: TaskQueue,
        scheduler: TaskScheduler,
        registry: Arc<TaskRegistry>,
        bus: EventBus,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            tracker,
            queue,
            scheduler,
            registry,
            bus: bus.clone(),
            request_subscription: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let weak: Weak<ManagerInner> = Arc::downgrade(&inner);
        let id = bus.subscribe(Some(EventKind::TaskRequest), move |event| {
            let TaskEvent::TaskRequest { task, schedule } = event else {
                return;
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            debug!(task_id = %task.id(), "task requested over the bus");
            if let Err(e) = inner.add_task(task.clone(), schedule.clone()) {
                warn!(task_id = %task.id(), error = %e, "requested task was not accepted");
            }
        });
        *lock(&inner.request_subscription) = Some(id);

        Self { inner }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Queue `task` now, or register it with the scheduler when `schedule` is given.
    pub fn add_task(&self, task: TaskHandle, schedule: Option<Trigger>) -> Result<TaskSubmission, TaskSystemError> {
        self.inner.add_task(task, schedule)
    }

    /// Build a chain from `tasks` and submit it like any other task.
    pub fn add_chain_task(
        &self,
        name: &str,
        tasks: Vec<TaskHandle>,
        description: Option<&str>,
        schedule: Option<Trigger>,
        policy: ChainPolicy,
    ) -> Result<TaskSubmission, TaskSystemError> {
        let mut options = TaskOptions::named(name);
        if let Some(description) = description {
            options = options.description(description);
        }
        let chain = TaskChain::build(options, tasks, policy);
        info!(
            chain_id = %chain.id(),
            name,
            children = chain.children().len(),
            "chain created"
        );
        self.add_task(chain, schedule)
    }

    pub fn cancel_task(&self, id: TaskId) -> Result<(), TaskSystemError> {
        self.inner.cancel_task(id)
    }

    /// Pause a running task. Returns `Ok(false)` (with a warning) when it is not running.
    pub fn pause_task(&self, id: TaskId) -> Result<bool, TaskSystemError> {
        self.inner.pause_task(id)
    }

    /// Resume a paused task. Returns `Ok(false)` (with a warning) when it is not paused.
    pub fn resume_task(&self, id: TaskId) -> Result<bool, TaskSystemError> {
        self.inner.resume_task(id)
    }

    pub fn remove_scheduled_task(&self, job_id: JobId) -> Result<(), TaskSystemError> {
        self.inner.scheduler.remove_scheduled_task(job_id)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskInfo, TaskSystemError> {
        self.inner.tracker.get_task_info(id)
    }

    /// Top-level active tasks; chain children appear inside their chain's `sub_tasks`.
    pub fn get_all_tasks(&self) -> Vec<TaskInfo> {
        self.inner.tracker.get_all_tasks_info(false)
    }

    pub fn get_failed_tasks(&self) -> Vec<Value> {
        self.inner.tracker.failed_tasks()
    }

    pub fn get_completed_tasks(&self) -> Vec<Value> {
        self.inner.tracker.completed_tasks()
    }

    pub fn get_scheduled_jobs(&self) -> Vec<ScheduledJobInfo> {
        self.inner.scheduler.get_scheduled_jobs()
    }

    pub fn get_tasks_by_tag(&self, tag: &str) -> Vec<TaskInfo> {
        self.inner.tracker.get_tasks_by_tag(tag)
    }

    pub fn has_tasks_with_tag(&self, tag: &str) -> bool {
        self.inner.tracker.has_tasks_with_tag(tag)
    }

    pub fn set_max_concurrent_tasks(&self, n: usize) -> bool {
        self.inner.queue.set_max_concurrent(n)
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.inner.queue.queue_status()
    }

    /// No pending, running or retry-waiting work.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_idle()
    }

    /// Cancel every task carrying `tag`.
    pub fn stop_tasks_by_tag(&self, tag: &str, include_chain_children: bool) -> BulkOutcome {
        self.inner.apply_by_tag(tag, include_chain_children, BulkAction::Cancel)
    }

    pub fn cancel_tasks_by_tag(&self, tag: &str, include_chain_children: bool) -> BulkOutcome {
        self.stop_tasks_by_tag(tag, include_chain_children)
    }

    pub fn pause_tasks_by_tag(&self, tag: &str, include_chain_children: bool) -> BulkOutcome {
        self.inner.apply_by_tag(tag, include_chain_children, BulkAction::Pause)
    }

    pub fn resume_tasks_by_tag(&self, tag: &str, include_chain_children: bool) -> BulkOutcome {
        self.inner.apply_by_tag(tag, include_chain_children, BulkAction::Resume)
    }

    /// Restore failure/completion history, persistent pending tasks and scheduled jobs.
    pub fn load_state(&self) -> Result<(), TaskSystemError> {
        let inner = &self.inner;
        inner.tracker.load_state()?;
        let tasks = inner.queue.load_state(&inner.registry)?;
        let jobs = inner.scheduler.load_state()?;
        info!(tasks, jobs, "task system state loaded");
        Ok(())
    }

    pub fn save_state(&self) -> Result<(), TaskSystemError> {
        let inner = &self.inner;
        inner.tracker.save_state()?;
        inner.queue.save_state()?;
        inner.scheduler.save_state()?;
        debug!("task system state saved");
        Ok(())
    }

    /// Save state, stop scheduler timers and the queue's control loop.
    /// Running task bodies are not interrupted.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.save_state() {
            warn!(error = %e, "state could not be saved during shutdown");
        }
        inner.scheduler.shutdown();
        inner.queue.shutdown();
        if let Some(id) = lock(&inner.request_subscription).take() {
            inner.bus.unsubscribe(id);
        }
        info!("task manager shut down");
    }
}

impl ManagerInner {
    fn add_task(&self, task: TaskHandle, schedule: Option<Trigger>) -> Result<TaskSubmission, TaskSystemError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TaskSystemError::ShutDown);
        }
        match schedule {
            None => {
                // The tracker announces `TaskAdded` on registration.
                self.queue.add_task(task.clone())?;
                Ok(TaskSubmission::Queued(task.id()))
            }
            Some(trigger) => {
                let job_id = self.scheduler.add_scheduled_task(&task, trigger)?;
                self.bus.publish(TaskEvent::TaskAdded { task_id: task.id() });
                Ok(TaskSubmission::Scheduled(job_id))
            }
        }
    }

    fn find(&self, id: TaskId) -> Result<TaskHandle, TaskSystemError> {
        self.tracker.get_task(id).ok_or(TaskSystemError::TaskNotFound(id))
    }

    fn cancel_task(&self, id: TaskId) -> Result<(), TaskSystemError> {
        let task = self.find(id)?;
        if !self.queue.cancel_task(id) {
            // Chain children are tracked but never queued on their own.
            task.cancel();
        }
        info!(task_id = %id, "task cancel requested");
        Ok(())
    }

    fn pause_task(&self, id: TaskId) -> Result<bool, TaskSystemError> {
        let task = self.find(id)?;
        let status = task.status();
        if status != TaskStatus::Running {
            warn!(task_id = %id, status = %status, "only running tasks can be paused");
            return Ok(false);
        }
        task.pause()?;
        info!(task_id = %id, "task paused");
        Ok(true)
    }

    fn resume_task(&self, id: TaskId) -> Result<bool, TaskSystemError> {
        let task = self.find(id)?;
        let status = task.status();
        if status != TaskStatus::Paused {
            warn!(task_id = %id, status = %status, "only paused tasks can be resumed");
            return Ok(false);
        }
        task.resume()?;
        info!(task_id = %id, "task resumed");
        Ok(true)
    }

    fn apply_by_tag(&self, tag: &str, include_chain_children: bool, action: BulkAction) -> BulkOutcome {
        let mut ids: Vec<TaskId> = self.tracker.get_uuids_by_tag(tag).into_iter().collect();
        ids.sort();

        let mut outcome = BulkOutcome::default();
        for id in ids {
            if !include_chain_children && self.tracker.is_chain_child(id) {
                outcome.skipped.push(id);
                continue;
            }
            let result = match action {
                BulkAction::Cancel => self.cancel_task(id).map(|()| true),
                BulkAction::Pause => self.pause_task(id),
                BulkAction::Resume => self.resume_task(id),
            };
            match result {
                Ok(true) => outcome.applied.push(id),
                Ok(false) => outcome.skipped.push(id),
                Err(e) => {
                    warn!(task_id = %id, tag, action = action.name(), error = %e, "bulk operation failed for task");
                    outcome.failed.push((id, e));
                }
            }
        }
        info!(
            tag,
            action = action.name(),
            applied = outcome.applied.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            "bulk operation by tag"
        );
        outcome
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(id) = lock(&self.request_subscription).take() {
            self.bus.unsubscribe(id);
        }
    }
}
