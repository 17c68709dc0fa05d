//! TaskHandle - タスク実体（共通状態 + 本体 + 一時停止ゲート + キャンセルフラグ）
//!
//! # 設計
//! - 本体（[`DynTask`]）は型消去された runnable。共通状態はハンドル側が持つ
//! - イベント発行能力は合成で持つ（attach された [`EventBus`]）
//! - `Arc` ベースなので clone は安価。Tracker / Queue / Chain が同じ実体を共有する
//!
//! # 不変条件
//! - `progress` は常に 0..=100
//! - `finished_at` は終端状態のときだけ `Some`
//! - 状態遷移は [`TaskStatus::can_transition_to`] に従う（`run()` の最終化のみ例外）
//! - ロックを保持したままイベントを発行しない

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::context::TaskContext;
use super::gate::PauseGate;
use super::options::TaskOptions;
use crate::chain::{ChainContext, TaskChain};
use crate::domain::record::MIN_RETRY_DELAY_MS;
use crate::domain::{
    ErrorInfo, FailureDetail, SerializedTask, TaskEvent, TaskFailure, TaskId, TaskStatus,
    TaskSystemError, UniqueType,
};
use crate::impls::EventBus;
use crate::sync::lock;
use crate::tracker::TaskInfo;
use crate::typed::{DynTask, Task, TypedTask};

/// Reserved tag carried by every chain child.
pub const CHAIN_CHILD_TAG: &str = "_ChainedChild";

/// Tag linking a chain child to its chain.
pub fn parent_tag(chain_id: TaskId) -> String {
    format!("parent:{chain_id}")
}

#[derive(Debug)]
struct TaskState {
    name: String,
    description: String,
    status: TaskStatus,
    progress: u8,
    result: Option<Value>,
    error: Option<String>,
    error_detail: Option<Value>,
    failure_permanent: bool,
    /// Set by `TaskContext::fail`; checked when `handle()` returns Ok.
    explicit_failure: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    is_persistent: bool,
    max_retries: u32,
    retry_delay: Duration,
    current_retry_attempts: u32,
    fail_silently: bool,
    tags: BTreeSet<String>,
    unique_type: UniqueType,
    unique_via: Option<String>,
    chain_id: Option<TaskId>,
}

impl TaskState {
    fn apply_status(&mut self, next: TaskStatus) {
        self.status = next;
        if next.is_terminal() {
            if self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
        } else {
            self.finished_at = None;
        }
    }
}

struct TaskInner {
    id: TaskId,
    body: Box<dyn DynTask>,
    state: Mutex<TaskState>,
    cancelled: AtomicBool,
    gate: PauseGate,
    bus: Mutex<Option<EventBus>>,
    chain_context: Mutex<Option<ChainContext>>,
    tag_observer: Mutex<Option<TagObserver>>,
}

/// Called with the task id and the tag after every tag change. Installed by the tracker.
pub(crate) type TagObserver = Arc<dyn Fn(TaskId, &str) + Send + Sync>;

#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

/// Non-owning reference, used by bus subscriptions that must not keep a task alive.
#[derive(Clone)]
pub struct WeakTaskHandle {
    inner: Weak<TaskInner>,
}

impl WeakTaskHandle {
    pub fn upgrade(&self) -> Option<TaskHandle> {
        self.inner.upgrade().map(|inner| TaskHandle { inner })
    }
}

impl TaskHandle {
    pub fn new<T: Task>(body: T) -> Self {
        Self::with_options(body, TaskOptions::default())
    }

    pub fn with_options<T: Task>(body: T, options: TaskOptions) -> Self {
        Self::from_body(TaskId::generate(), Box::new(TypedTask::new(body)), options)
    }

    pub(crate) fn from_body(id: TaskId, body: Box<dyn DynTask>, options: TaskOptions) -> Self {
        let type_name = body.type_name().to_string();
        let mut tags: BTreeSet<String> = options.tags.into_iter().collect();
        tags.insert(type_name.clone());

        let state = TaskState {
            name: options.name.unwrap_or(type_name),
            description: options.description,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            error_detail: None,
            failure_permanent: false,
            explicit_failure: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            is_persistent: options.is_persistent,
            max_retries: options.max_retries,
            retry_delay: options.retry_delay,
            current_retry_attempts: 0,
            fail_silently: options.fail_silently,
            tags,
            unique_type: options.unique_type,
            unique_via: options.unique_via,
            chain_id: None,
        };
        Self::assemble(id, body, state)
    }

    /// Rebuild a task from its snapshot.
    ///
    /// A snapshot taken mid-flight (RUNNING / PAUSED / RETRYING) comes back as PENDING.
    pub(crate) fn restore(body: Box<dyn DynTask>, record: &SerializedTask) -> Self {
        let mut tags = record.tags.clone();
        tags.insert(body.type_name().to_string());

        let status = match record.status {
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::Retrying => TaskStatus::Pending,
            other => other,
        };
        let finished_at = if status.is_terminal() {
            Some(record.finished_at.unwrap_or_else(Utc::now))
        } else {
            None
        };

        let state = TaskState {
            name: record.name.clone(),
            description: record.description.clone(),
            status,
            progress: record.progress.min(100),
            result: record.result.clone(),
            error: record.error.clone(),
            error_detail: record.error_detail.clone(),
            failure_permanent: false,
            explicit_failure: false,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at,
            is_persistent: record.is_persistent,
            max_retries: record.max_retries,
            retry_delay: Duration::from_millis(record.retry_delay_ms.max(MIN_RETRY_DELAY_MS)),
            current_retry_attempts: record.current_retry_attempts,
            fail_silently: record.fail_silently,
            tags,
            unique_type: record.unique_type,
            unique_via: record.unique_via.clone(),
            chain_id: record.chain_id,
        };
        Self::assemble(record.id, body, state)
    }

    fn assemble(id: TaskId, body: Box<dyn DynTask>, state: TaskState) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id,
                body,
                state: Mutex::new(state),
                cancelled: AtomicBool::new(false),
                gate: PauseGate::new(),
                bus: Mutex::new(None),
                chain_context: Mutex::new(None),
                tag_observer: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakTaskHandle {
        WeakTaskHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================
    // Read accessors
    // ========================================

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn type_name(&self) -> &str {
        self.inner.body.type_name()
    }

    /// Downcast the body to its concrete task type.
    pub fn body<T: Task>(&self) -> Option<&T> {
        self.inner.body.as_any().downcast_ref::<T>()
    }

    pub fn as_chain(&self) -> Option<&TaskChain> {
        self.inner.body.as_chain()
    }

    pub fn is_chain(&self) -> bool {
        self.as_chain().is_some()
    }

    pub fn name(&self) -> String {
        lock(&self.inner.state).name.clone()
    }

    pub fn description(&self) -> String {
        lock(&self.inner.state).description.clone()
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.inner.state).status
    }

    pub fn progress(&self) -> u8 {
        lock(&self.inner.state).progress
    }

    pub fn result(&self) -> Option<Value> {
        lock(&self.inner.state).result.clone()
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.inner.state).error.clone()
    }

    pub fn error_detail(&self) -> Option<Value> {
        lock(&self.inner.state).error_detail.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        lock(&self.inner.state).created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).finished_at
    }

    pub fn is_persistent(&self) -> bool {
        lock(&self.inner.state).is_persistent
    }

    pub fn max_retries(&self) -> u32 {
        lock(&self.inner.state).max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        lock(&self.inner.state).retry_delay
    }

    pub fn current_retry_attempts(&self) -> u32 {
        lock(&self.inner.state).current_retry_attempts
    }

    pub fn fail_silently(&self) -> bool {
        lock(&self.inner.state).fail_silently
    }

    pub fn tags(&self) -> BTreeSet<String> {
        lock(&self.inner.state).tags.clone()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        lock(&self.inner.state).tags.contains(tag)
    }

    pub fn unique_type(&self) -> UniqueType {
        lock(&self.inner.state).unique_type
    }

    /// Uniqueness key; the type name unless overridden.
    pub fn unique_key(&self) -> String {
        lock(&self.inner.state)
            .unique_via
            .clone()
            .unwrap_or_else(|| self.type_name().to_string())
    }

    pub fn chain_id(&self) -> Option<TaskId> {
        lock(&self.inner.state).chain_id
    }

    pub fn is_chain_child(&self) -> bool {
        self.has_tag(CHAIN_CHILD_TAG)
    }

    /// Children of a chain; empty for plain tasks.
    pub fn children(&self) -> &[TaskHandle] {
        self.as_chain().map(TaskChain::children).unwrap_or(&[])
    }

    pub fn chain_context(&self) -> Option<ChainContext> {
        lock(&self.inner.chain_context).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether a worker thread is currently blocked in `check_paused`.
    pub fn is_waiting_on_pause(&self) -> bool {
        self.inner.gate.waiters() > 0
    }

    // ========================================
    // Mutators
    // ========================================

    pub fn add_tag(&self, tag: impl Into<String>) {
        let tag = tag.into();
        let added = lock(&self.inner.state).tags.insert(tag.clone());
        if added {
            self.tags_changed(&tag);
        }
    }

    /// The type-name tag cannot be removed.
    pub fn remove_tag(&self, tag: &str) -> bool {
        if tag == self.type_name() {
            return false;
        }
        let removed = lock(&self.inner.state).tags.remove(tag);
        if removed {
            self.tags_changed(tag);
        }
        removed
    }

    pub(crate) fn set_tag_observer(&self, observer: Option<TagObserver>) {
        *lock(&self.inner.tag_observer) = observer;
    }

    // The state lock is released before the observer runs; it takes the tracker lock.
    fn tags_changed(&self, tag: &str) {
        let observer = lock(&self.inner.tag_observer).clone();
        if let Some(observer) = observer {
            observer(self.id(), tag);
        }
    }

    /// Guarded transition; emits `TaskStatusUpdated` only when the status changes.
    pub fn set_status(&self, next: TaskStatus) -> Result<(), TaskSystemError> {
        {
            let mut state = lock(&self.inner.state);
            let current = state.status;
            if current == next {
                return Ok(());
            }
            if !current.can_transition_to(next) {
                return Err(TaskSystemError::InvalidTaskState {
                    task_id: self.id(),
                    current,
                    operation: "set_status",
                });
            }
            state.apply_status(next);
        }
        self.emit(TaskEvent::TaskStatusUpdated {
            task_id: self.id(),
            status: next,
        });
        Ok(())
    }

    /// Final transition of `run()`; bypasses the table so every run ends terminal.
    fn force_status(&self, next: TaskStatus) {
        let changed = {
            let mut state = lock(&self.inner.state);
            let changed = state.status != next;
            if changed && !state.status.can_transition_to(next) {
                debug!(task_id = %self.id(), from = %state.status, to = %next, "forcing final status");
            }
            state.apply_status(next);
            changed
        };
        if changed {
            self.emit(TaskEvent::TaskStatusUpdated {
                task_id: self.id(),
                status: next,
            });
        }
    }

    /// Clamped to 0..=100.
    pub fn set_progress(&self, value: i64) {
        let progress = value.clamp(0, 100) as u8;
        lock(&self.inner.state).progress = progress;
        self.emit(TaskEvent::TaskProgressUpdated {
            task_id: self.id(),
            progress,
        });
    }

    pub fn set_result(&self, result: Value) {
        lock(&self.inner.state).result = Some(result);
    }

    /// Record a business-level failure; `run()` finalizes it as FAILED.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = lock(&self.inner.state);
        state.error = Some(reason.clone());
        state.error_detail = serde_json::to_value(FailureDetail {
            kind: "TaskFailure".to_string(),
            message: reason,
            code: None,
            permanent: false,
        })
        .ok();
        state.explicit_failure = true;
    }

    /// Set the cancellation flag.
    ///
    /// A task that is not inside `handle()` (PENDING / PAUSED / RETRYING) becomes CANCELLED at
    /// once; a running one finishes as CANCELLED when its body observes the flag.
    /// The cleanup hook runs on the first call only.
    pub fn cancel(&self) {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        self.inner.gate.open();

        let status = self.status();
        if matches!(
            status,
            TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Retrying
        ) && let Err(e) = self.set_status(TaskStatus::Cancelled)
        {
            debug!(task_id = %self.id(), error = %e, "cancel raced with a status change");
        }

        if first {
            debug!(task_id = %self.id(), status = %status, "cancellation requested");
            if catch_unwind(AssertUnwindSafe(|| self.inner.body.cleanup())).is_err() {
                error!(task_id = %self.id(), "cancellation cleanup panicked");
            }
        }
    }

    pub fn pause(&self) -> Result<(), TaskSystemError> {
        let current = self.status();
        if current != TaskStatus::Running {
            return Err(TaskSystemError::InvalidTaskState {
                task_id: self.id(),
                current,
                operation: "pause",
            });
        }
        self.inner.gate.arm();
        if let Err(e) = self.set_status(TaskStatus::Paused) {
            self.inner.gate.open();
            return Err(e);
        }
        if let Some(child) = self.as_chain().and_then(TaskChain::active_child)
            && let Err(e) = child.pause()
        {
            debug!(task_id = %self.id(), child_id = %child.id(), error = %e, "active chain child not paused");
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), TaskSystemError> {
        let current = self.status();
        if current != TaskStatus::Paused {
            return Err(TaskSystemError::InvalidTaskState {
                task_id: self.id(),
                current,
                operation: "resume",
            });
        }
        self.inner.gate.open();
        self.set_status(TaskStatus::Running)?;
        if let Some(child) = self.as_chain().and_then(TaskChain::active_child)
            && child.status() == TaskStatus::Paused
            && let Err(e) = child.resume()
        {
            debug!(task_id = %self.id(), child_id = %child.id(), error = %e, "active chain child not resumed");
        }
        Ok(())
    }

    /// Block the calling worker thread while paused; returns early on cancellation.
    pub fn check_paused(&self) {
        self.inner.gate.wait(|| self.is_cancelled());
    }

    /// Cancellable sleep. Returns `false` if cancelled before `duration` elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.inner.gate.sleep(duration, || self.is_cancelled())
    }

    // ========================================
    // Execution
    // ========================================

    /// Execute the body on the calling (worker) thread.
    ///
    /// Never propagates a body failure; the returned final status is the signal.
    /// `TaskFinished` is emitted exactly once per call.
    pub fn run(&self) -> TaskStatus {
        let started = Instant::now();

        if self.is_cancelled() {
            self.finalize_cancelled();
            return self.finish(started);
        }

        {
            let mut state = lock(&self.inner.state);
            state.started_at = Some(Utc::now());
            state.explicit_failure = false;
        }
        if let Err(e) = self.set_status(TaskStatus::Running) {
            warn!(task_id = %self.id(), error = %e, "task cannot start");
            if self.is_cancelled() {
                self.finalize_cancelled();
            }
            return self.finish(started);
        }
        info!(task_id = %self.id(), task_type = self.type_name(), name = %self.name(), "task started");

        let ctx = TaskContext::new(self.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| self.inner.body.handle(&ctx)));

        let final_status = if self.is_cancelled() {
            TaskStatus::Cancelled
        } else {
            match outcome {
                Ok(Ok(())) if lock(&self.inner.state).explicit_failure => TaskStatus::Failed,
                Ok(Ok(())) => TaskStatus::Completed,
                Ok(Err(TaskFailure::Cancelled)) => TaskStatus::Cancelled,
                Ok(Err(TaskFailure::Failed(detail))) => {
                    self.record_failure(detail);
                    TaskStatus::Failed
                }
                Err(panic) => {
                    self.record_failure(FailureDetail {
                        kind: "Panic".to_string(),
                        message: panic_message(panic.as_ref()),
                        code: None,
                        permanent: false,
                    });
                    TaskStatus::Failed
                }
            }
        };

        if final_status == TaskStatus::Cancelled {
            self.finalize_cancelled();
        } else {
            self.force_status(final_status);
        }
        self.finish(started)
    }

    fn finalize_cancelled(&self) {
        lock(&self.inner.state)
            .error
            .get_or_insert_with(|| "CANCELLED".to_string());
        self.force_status(TaskStatus::Cancelled);
    }

    fn record_failure(&self, detail: FailureDetail) {
        let mut state = lock(&self.inner.state);
        state.error = Some(format!("{}: {}", detail.kind, detail.message));
        state.failure_permanent = detail.permanent;
        state.error_detail = serde_json::to_value(&detail).ok();
    }

    fn finish(&self, started: Instant) -> TaskStatus {
        let (status, result, error, detail, fail_silently) = {
            let state = lock(&self.inner.state);
            (
                state.status,
                state.result.clone(),
                state.error.clone(),
                state.error_detail.clone(),
                state.fail_silently,
            )
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match status {
            TaskStatus::Failed if !fail_silently => {
                error!(task_id = %self.id(), elapsed_ms, error = error.as_deref().unwrap_or(""), "task failed");
            }
            TaskStatus::Failed => {
                warn!(task_id = %self.id(), elapsed_ms, error = error.as_deref().unwrap_or(""), "task failed");
            }
            _ => info!(task_id = %self.id(), elapsed_ms, status = %status, "task finished"),
        }

        self.emit(TaskEvent::TaskFinished {
            task_id: self.id(),
            status,
            result,
            error: error.map(|message| ErrorInfo { message, detail }),
        });
        status
    }

    // ========================================
    // Engine-internal hooks
    // ========================================

    /// Bind the event bus and pause poll interval (recursively for chain children).
    pub(crate) fn attach(&self, bus: &EventBus, pause_poll: Duration) {
        *lock(&self.inner.bus) = Some(bus.clone());
        self.inner.gate.set_poll_interval(pause_poll);
        for child in self.children() {
            child.attach(bus, pause_poll);
        }
    }

    pub(crate) fn bus(&self) -> Option<EventBus> {
        lock(&self.inner.bus).clone()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        if let Some(bus) = self.bus() {
            bus.publish(event);
        }
    }

    pub(crate) fn failure_is_permanent(&self) -> bool {
        lock(&self.inner.state).failure_permanent
    }

    pub(crate) fn increment_retry_attempts(&self) -> u32 {
        let mut state = lock(&self.inner.state);
        state.current_retry_attempts += 1;
        state.current_retry_attempts
    }

    /// FAILED → RETRYING without emitting; returns the new attempt number.
    /// Lets the queue park the task under its own lock and announce afterwards.
    pub(crate) fn enter_retrying(&self) -> u32 {
        let mut state = lock(&self.inner.state);
        state.current_retry_attempts += 1;
        if state.status == TaskStatus::Failed {
            state.apply_status(TaskStatus::Retrying);
        }
        state.current_retry_attempts
    }

    /// Emits the RETRYING transition made by `enter_retrying`, unless something moved on since.
    pub(crate) fn announce_retrying(&self) {
        if self.status() == TaskStatus::Retrying {
            self.emit(TaskEvent::TaskStatusUpdated {
                task_id: self.id(),
                status: TaskStatus::Retrying,
            });
        }
    }

    /// Back to PENDING with the previous outcome cleared. The cancel flag is kept.
    pub(crate) fn reset_for_retry(&self) {
        let mut state = lock(&self.inner.state);
        state.error = None;
        state.error_detail = None;
        state.result = None;
        state.failure_permanent = false;
        state.explicit_failure = false;
        state.progress = 0;
        let changed = state.status != TaskStatus::Pending;
        if changed && state.status != TaskStatus::Cancelled {
            state.apply_status(TaskStatus::Pending);
            drop(state);
            self.emit(TaskEvent::TaskStatusUpdated {
                task_id: self.id(),
                status: TaskStatus::Pending,
            });
        }
    }

    pub(crate) fn link_to_chain(&self, chain_id: TaskId) {
        let mut state = lock(&self.inner.state);
        state.chain_id = Some(chain_id);
        state.tags.insert(CHAIN_CHILD_TAG.to_string());
        state.tags.insert(parent_tag(chain_id));
    }

    pub(crate) fn inject_chain_context(&self, context: ChainContext) {
        *lock(&self.inner.chain_context) = Some(context);
    }

    // ========================================
    // Serialization
    // ========================================

    pub fn serialize(&self) -> Result<SerializedTask, serde_json::Error> {
        let fields = self.inner.body.fields()?;
        Ok(self.record_with_fields(fields))
    }

    /// Like `serialize`, but a body that cannot encode its fields yields `fields: null`.
    pub fn snapshot(&self) -> SerializedTask {
        let fields = self.inner.body.fields().unwrap_or_else(|e| {
            warn!(task_id = %self.id(), error = %e, "task fields are not serializable");
            Value::Null
        });
        self.record_with_fields(fields)
    }

    /// Projection for status queries (chains include their children).
    pub fn info(&self) -> TaskInfo {
        TaskInfo::from_task(self)
    }

    fn record_with_fields(&self, fields: Value) -> SerializedTask {
        let state = lock(&self.inner.state);
        SerializedTask {
            id: self.id(),
            task_type: self.type_name().to_string(),
            name: state.name.clone(),
            description: state.description.clone(),
            status: state.status,
            progress: state.progress,
            result: state.result.clone(),
            error: state.error.clone(),
            error_detail: state.error_detail.clone(),
            created_at: state.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            is_persistent: state.is_persistent,
            max_retries: state.max_retries,
            retry_delay_ms: state.retry_delay.as_millis() as u64,
            current_retry_attempts: state.current_retry_attempts,
            fail_silently: state.fail_silently,
            unique_type: state.unique_type,
            unique_via: state.unique_via.clone(),
            chain_id: state.chain_id,
            tags: state.tags.clone(),
            fields,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task body panicked".to_string()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("status", &self.status())
            .finish()
    }
}
