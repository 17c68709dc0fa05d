//! Queue - 同時実行数を制限した FIFO ディスパッチャ
//!
//! # 設計
//! - タスク本体は `spawn_blocking` のワーカースレッドで `run()` される
//! - ワーカーは完了を `(task_id, seq)` として mpsc で制御ループへ送る。
//!   実行中エントリの seq と一致した場合のみ受理するため、完了処理は 1 ディスパッチにつき 1 回
//! - リトライ待ちはワーカースロットを占有しない（`tokio::time::sleep` のタイマーが制御ループへ通知）
//! - リトライされたタスクは pending の末尾に戻る（新しく追加されたタスクを追い越さない）
//!
//! # 不変条件
//! - `running.len() <= max_concurrent`
//! - ロックを保持したままイベントを発行しない

mod retry;
mod state;

pub use self::retry::RetryPolicy;

use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::state::{QueueState, WaitingEntry};
use crate::domain::{SerializedTask, TaskEvent, TaskId, TaskStatus, TaskSystemError};
use crate::impls::EventBus;
use crate::observability::QueueStatus;
use crate::ports::KvStore;
use crate::sync::lock;
use crate::task::TaskHandle;
use crate::tracker::Tracker;
use crate::typed::TaskRegistry;

pub const PENDING_TASKS_KEY: &str = "pendingTasks";

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    pub pause_poll_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            retry: RetryPolicy::default(),
            pause_poll_interval: Duration::from_millis(500),
        }
    }
}

enum QueueMessage {
    Finished { task_id: TaskId, seq: u64 },
    RetryDue { task_id: TaskId },
    Shutdown,
}

/// Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    tracker: Arc<Tracker>,
    bus: EventBus,
    store: Arc<dyn KvStore>,
    runtime: Handle,
    tx: mpsc::UnboundedSender<QueueMessage>,
    retry: RetryPolicy,
    pause_poll_interval: Duration,
}

impl TaskQueue {
    /// Spawns the control loop on `runtime`.
    pub fn new(
        tracker: Arc<Tracker>,
        bus: EventBus,
        store: Arc<dyn KvStore>,
        runtime: Handle,
        options: QueueOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::new(options.max_concurrent)),
            tracker,
            bus,
            store,
            runtime: runtime.clone(),
            tx,
            retry: options.retry,
            pause_poll_interval: options.pause_poll_interval,
        });
        runtime.spawn(control_loop(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    /// Append to `pending`, register with the tracker, then dispatch.
    pub fn add_task(&self, task: TaskHandle) -> Result<(), TaskSystemError> {
        let shared = &self.shared;
        shared.check_admission(&task)?;

        task.attach(&shared.bus, shared.pause_poll_interval);
        let newly_tracked = shared.tracker.add_task(&task);

        {
            let mut state = lock(&shared.state);
            // Re-check: another submitter may have won the race since the first check.
            let rejection = if state.shut_down {
                Some(TaskSystemError::ShutDown)
            } else if state.contains(task.id()) {
                Some(TaskSystemError::AlreadyQueued(task.id()))
            } else {
                state.unique_conflict(&task).map(|unique_key| TaskSystemError::UniqueViolation {
                    task_id: task.id(),
                    unique_key,
                })
            };
            if let Some(err) = rejection {
                drop(state);
                if newly_tracked && let Err(e) = shared.tracker.remove_task(task.id()) {
                    debug!(task_id = %task.id(), error = %e, "rejected task was already untracked");
                }
                return Err(err);
            }
            state.pending.push_back(task.clone());
        }

        info!(task_id = %task.id(), task_type = task.type_name(), name = %task.name(), "task queued");
        shared.bus.publish(TaskEvent::TaskQueued { task_id: task.id() });
        if task.is_persistent() {
            shared.persist();
        }
        shared.publish_status();
        shared.dispatch();
        Ok(())
    }

    /// Cancel a queued task. A pending or retry-waiting task is dropped at once;
    /// a running one is flagged and finishes when its body observes the flag.
    ///
    /// Returns `false` if the queue does not hold the task.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let shared = &self.shared;
        let (task, dropped) = {
            let mut state = lock(&shared.state);
            if let Some(task) = state.remove_pending(id) {
                (task, true)
            } else if let Some(entry) = state.waiting_retry.remove(&id) {
                entry.timer.abort();
                (entry.task, true)
            } else if let Some(entry) = state.running.get(&id) {
                (entry.task.clone(), false)
            } else {
                return false;
            }
        };

        task.cancel();
        if dropped {
            debug!(task_id = %id, "cancelled task dropped from the queue");
            shared.tracker.finish_task(&task);
            if task.is_persistent() {
                shared.persist();
            }
            shared.publish_status();
        }
        true
    }

    /// Ignored (with a warning) when `n` is 0; never preempts running tasks.
    pub fn set_max_concurrent(&self, n: usize) -> bool {
        if n == 0 {
            warn!(requested = n, "ignoring non-positive max concurrent tasks");
            return false;
        }
        lock(&self.shared.state).max_concurrent = n;
        info!(max_concurrent = n, "max concurrent tasks updated");
        self.shared.publish_status();
        self.shared.dispatch();
        true
    }

    pub fn max_concurrent(&self) -> usize {
        lock(&self.shared.state).max_concurrent
    }

    pub fn queue_status(&self) -> QueueStatus {
        lock(&self.shared.state).status()
    }

    /// Whether the task is pending, running or waiting for a retry.
    pub fn contains(&self, id: TaskId) -> bool {
        lock(&self.shared.state).contains(id)
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.shared.state);
        state.pending.is_empty() && state.running.is_empty() && state.waiting_retry.is_empty()
    }

    /// Persist every persistent task that has not run yet (pending or waiting for a retry).
    pub fn save_state(&self) -> Result<(), TaskSystemError> {
        self.shared.save_state()
    }

    /// Re-queue persisted tasks. Records that cannot be decoded or resolved are skipped.
    ///
    /// Returns the number of tasks re-queued.
    pub fn load_state(&self, registry: &TaskRegistry) -> Result<usize, TaskSystemError> {
        let records = match self.shared.store.get(PENDING_TASKS_KEY)? {
            None => return Ok(0),
            Some(Value::Array(records)) => records,
            Some(_) => {
                warn!(key = PENDING_TASKS_KEY, "ignoring malformed pending task list");
                return Ok(0);
            }
        };

        let mut restored = 0;
        for value in records {
            let task = match SerializedTask::from_value(value)
                .map_err(TaskSystemError::from)
                .and_then(|record| registry.deserialize(&record))
            {
                Ok(task) => task,
                Err(e) => {
                    warn!(error = %e, "skipping unrestorable pending task");
                    continue;
                }
            };
            if task.status().is_terminal() {
                debug!(task_id = %task.id(), status = %task.status(), "skipping finished task");
                continue;
            }
            match self.add_task(task) {
                Ok(()) => restored += 1,
                Err(e) => warn!(error = %e, "restored task was not queued"),
            }
        }
        info!(restored, "pending tasks restored");
        Ok(restored)
    }

    /// Stop the control loop and abort retry timers. Running bodies are left alone.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            for entry in state.waiting_retry.values() {
                entry.timer.abort();
            }
        }
        let _ = self.shared.tx.send(QueueMessage::Shutdown);
        info!("task queue shut down");
    }
}

impl QueueShared {
    fn check_admission(&self, task: &TaskHandle) -> Result<(), TaskSystemError> {
        let state = lock(&self.state);
        if state.shut_down {
            return Err(TaskSystemError::ShutDown);
        }
        if task.is_cancelled() {
            return Err(TaskSystemError::TaskCancelled(task.id()));
        }
        if state.contains(task.id()) {
            return Err(TaskSystemError::AlreadyQueued(task.id()));
        }
        if let Some(unique_key) = state.unique_conflict(task) {
            warn!(task_id = %task.id(), unique_key = %unique_key, "task rejected by uniqueness rule");
            return Err(TaskSystemError::UniqueViolation {
                task_id: task.id(),
                unique_key,
            });
        }
        Ok(())
    }

    /// Fill free slots from the head of `pending`.
    fn dispatch(&self) {
        let mut dropped = Vec::new();
        let mut started = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.shut_down {
                return;
            }
            while state.has_free_slot() {
                let Some(head) = state.pending.front() else {
                    break;
                };
                if head.is_cancelled() || head.status() == TaskStatus::Cancelled {
                    if let Some(task) = state.pending.pop_front() {
                        dropped.push(task);
                    }
                    continue;
                }
                if let Some(entry) = state.start_next() {
                    started.push(entry);
                }
            }
        }

        for task in &dropped {
            debug!(task_id = %task.id(), "dropping cancelled task without running it");
            self.tracker.finish_task(task);
        }
        for (task, seq) in &started {
            debug!(task_id = %task.id(), seq, "task dispatched");
            self.bus.publish(TaskEvent::TaskDequeued { task_id: task.id() });

            let task = task.clone();
            let seq = *seq;
            let tx = self.tx.clone();
            self.runtime.spawn_blocking(move || {
                let task_id = task.id();
                task.run();
                if tx.send(QueueMessage::Finished { task_id, seq }).is_err() {
                    debug!(task_id = %task_id, "queue stopped before completion was reported");
                }
            });
        }
        if !dropped.is_empty() || !started.is_empty() {
            self.publish_status();
        }
    }

    /// Completion handler; runs on the control loop.
    ///
    /// A retryable task moves from `running` to `waiting_retry` in one lock section, so a
    /// concurrent `cancel_task` always finds it in one of the two.
    fn on_finished(&self, task_id: TaskId, seq: u64) {
        let completed = {
            let mut state = lock(&self.state);
            state.complete(task_id, seq).map(|task| {
                let retry = is_retryable(&task).then(|| self.park_for_retry(&mut state, &task));
                (task, retry)
            })
        };
        let Some((task, retry)) = completed else {
            debug!(task_id = %task_id, seq, "ignoring stale completion");
            return;
        };

        match retry {
            Some((attempt, delay)) => {
                task.announce_retrying();
                info!(
                    task_id = %task_id,
                    attempt,
                    max_retries = task.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
            }
            None => self.tracker.finish_task(&task),
        }
        if task.is_persistent() {
            self.persist();
        }
        self.publish_status();
        self.dispatch();
    }

    /// Caller holds the state lock; nothing here emits.
    fn park_for_retry(&self, state: &mut QueueState, task: &TaskHandle) -> (u32, Duration) {
        let attempt = task.enter_retrying();
        let delay = self.retry.next_delay(task.retry_delay(), attempt);

        let task_id = task.id();
        let tx = self.tx.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(QueueMessage::RetryDue { task_id });
        });
        state.waiting_retry.insert(
            task_id,
            WaitingEntry {
                task: task.clone(),
                timer,
            },
        );
        (attempt, delay)
    }

    /// Retry timer fired: back to the tail of `pending`.
    fn on_retry_due(&self, task_id: TaskId) {
        let Some(entry) = lock(&self.state).waiting_retry.remove(&task_id) else {
            return;
        };
        let task = entry.task;

        if task.is_cancelled() {
            // RETRYING → CANCELLED so the tracker only ever finishes terminal tasks.
            task.cancel();
            self.tracker.finish_task(&task);
        } else {
            task.reset_for_retry();
            lock(&self.state).pending.push_back(task.clone());
            debug!(task_id = %task_id, attempt = task.current_retry_attempts(), "task re-queued for retry");
            self.bus.publish(TaskEvent::TaskQueued { task_id });
        }
        self.publish_status();
        self.dispatch();
    }

    fn save_state(&self) -> Result<(), TaskSystemError> {
        let tasks = lock(&self.state).persistent_waiting();
        let mut records = Vec::with_capacity(tasks.len());
        for task in &tasks {
            match task.serialize().and_then(|record| record.to_value()) {
                Ok(value) => records.push(value),
                Err(e) => warn!(task_id = %task.id(), error = %e, "pending task not persisted"),
            }
        }
        self.store.set(PENDING_TASKS_KEY, Value::Array(records))?;
        self.store.flush()?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to persist pending tasks");
        }
    }

    fn publish_status(&self) {
        let status = lock(&self.state).status();
        self.bus.publish(TaskEvent::QueueStatusChanged(status));
    }
}

fn is_retryable(task: &TaskHandle) -> bool {
    task.status() == TaskStatus::Failed
        && !task.is_cancelled()
        && !task.failure_is_permanent()
        && task.current_retry_attempts() < task.max_retries()
}

async fn control_loop(shared: Weak<QueueShared>, mut rx: mpsc::UnboundedReceiver<QueueMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match message {
            QueueMessage::Finished { task_id, seq } => shared.on_finished(task_id, seq),
            QueueMessage::RetryDue { task_id } => shared.on_retry_due(task_id),
            QueueMessage::Shutdown => break,
        }
    }
    debug!("queue control loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::Task;
    use crate::domain::{EventKind, UniqueType};
    use crate::impls::InMemoryStore;
    use crate::task::TaskOptions;
    use crate::testing::{EchoTask, FailingTask, SleepyTask};
    use crate::tracker::HistoryLimits;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    struct Fixture {
        queue: TaskQueue,
        tracker: Arc<Tracker>,
        bus: EventBus,
        store: Arc<InMemoryStore>,
    }

    fn fixture_with(store: Arc<InMemoryStore>, max_concurrent: usize) -> Fixture {
        let bus = EventBus::new();
        let tracker = Arc::new(Tracker::new(store.clone(), bus.clone(), HistoryLimits::default()));
        let queue = TaskQueue::new(
            Arc::clone(&tracker),
            bus.clone(),
            store.clone(),
            Handle::current(),
            QueueOptions {
                max_concurrent,
                retry: RetryPolicy::default(),
                pause_poll_interval: Duration::from_millis(20),
            },
        );
        Fixture {
            queue,
            tracker,
            bus,
            store,
        }
    }

    fn fixture(max_concurrent: usize) -> Fixture {
        fixture_with(Arc::new(InMemoryStore::new()), max_concurrent)
    }

    async fn eventually(cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn dequeue_log(bus: &EventBus) -> Arc<Mutex<Vec<TaskId>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        bus.subscribe(Some(EventKind::TaskDequeued), move |event| {
            if let TaskEvent::TaskDequeued { task_id } = event {
                lock(&l).push(*task_id);
            }
        });
        log
    }

    fn quick_retries(max_retries: u32) -> TaskOptions {
        TaskOptions::new()
            .max_retries(max_retries)
            .retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn runs_a_task_and_releases_it() {
        let f = fixture(2);
        let task = TaskHandle::new(EchoTask { value: 5 });
        f.queue.add_task(task.clone()).unwrap();

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(!f.tracker.contains(task.id()));
    }

    #[tokio::test]
    async fn running_never_exceeds_capacity() {
        let f = fixture(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&peak);
        f.bus.subscribe(Some(EventKind::QueueStatusChanged), move |event| {
            if let TaskEvent::QueueStatusChanged(status) = event {
                p.fetch_max(status.running, Ordering::SeqCst);
            }
        });

        let tasks: Vec<TaskHandle> = (0..5)
            .map(|_| TaskHandle::new(SleepyTask { steps: 3, step_ms: 10 }))
            .collect();
        for task in &tasks {
            f.queue.add_task(task.clone()).unwrap();
        }

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(tasks.iter().all(|t| t.status() == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn dispatches_in_fifo_order() {
        let f = fixture(1);
        let log = dequeue_log(&f.bus);
        let tasks: Vec<TaskHandle> = (0..3).map(|i| TaskHandle::new(EchoTask { value: i })).collect();
        for task in &tasks {
            f.queue.add_task(task.clone()).unwrap();
        }

        eventually(|| f.queue.is_idle()).await;
        let expected: Vec<TaskId> = tasks.iter().map(TaskHandle::id).collect();
        assert_eq!(*lock(&log), expected);
    }

    #[tokio::test]
    async fn retries_exactly_max_retries_times() {
        let f = fixture(1);
        let body = FailingTask::always();
        let runs = Arc::clone(&body.runs);
        let task = TaskHandle::with_options(body, quick_retries(2));
        f.queue.add_task(task.clone()).unwrap();

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.current_retry_attempts(), 2);
        assert_eq!(f.tracker.failed_tasks().len(), 1);
    }

    #[tokio::test]
    async fn completion_handler_runs_once_per_attempt() {
        let f = fixture(1);
        let finished = Arc::new(AtomicU32::new(0));
        let removed = Arc::new(AtomicU32::new(0));
        let (fi, re) = (Arc::clone(&finished), Arc::clone(&removed));
        f.bus.subscribe(Some(EventKind::TaskFinished), move |_| {
            fi.fetch_add(1, Ordering::SeqCst);
        });
        f.bus.subscribe(Some(EventKind::TaskRemoved), move |_| {
            re.fetch_add(1, Ordering::SeqCst);
        });

        let task = TaskHandle::with_options(FailingTask::times(2), quick_retries(2));
        f.queue.add_task(task.clone()).unwrap();

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retried_task_goes_to_the_tail() {
        let f = fixture(1);
        let log = dequeue_log(&f.bus);
        let flaky = TaskHandle::with_options(FailingTask::times(1), quick_retries(1));
        let slow = TaskHandle::new(SleepyTask { steps: 4, step_ms: 20 });
        f.queue.add_task(flaky.clone()).unwrap();
        f.queue.add_task(slow.clone()).unwrap();

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(*lock(&log), vec![flaky.id(), slow.id(), flaky.id()]);
        assert_eq!(flaky.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn retrying_task_is_always_held_by_the_queue() {
        let f = fixture(1);
        let held = Arc::new(Mutex::new(Vec::new()));
        let (queue, h) = (f.queue.clone(), Arc::clone(&held));
        f.bus.subscribe(Some(EventKind::TaskStatusUpdated), move |event| {
            if let TaskEvent::TaskStatusUpdated {
                task_id,
                status: TaskStatus::Retrying,
            } = event
            {
                lock(&h).push(queue.contains(*task_id));
            }
        });

        let task = TaskHandle::with_options(FailingTask::times(2), quick_retries(2));
        f.queue.add_task(task.clone()).unwrap();

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(*lock(&held), vec![true, true]);
    }

    #[tokio::test]
    async fn cancel_between_attempts_finishes_cancelled() {
        let f = fixture(1);
        let body = FailingTask::always();
        let runs = Arc::clone(&body.runs);
        let task = TaskHandle::with_options(
            body,
            TaskOptions::new()
                .max_retries(3)
                .retry_delay(Duration::from_millis(300)),
        );
        f.queue.add_task(task.clone()).unwrap();
        eventually(|| task.status() == TaskStatus::Retrying).await;

        assert!(f.queue.cancel_task(task.id()));
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.finished_at().is_some());
        assert!(!f.tracker.contains(task.id()));

        sleep(Duration::from_millis(400)).await;
        assert!(f.queue.is_idle());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(f.tracker.failed_tasks().is_empty());
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let f = fixture(1);
        let body = FailingTask::permanent();
        let runs = Arc::clone(&body.runs);
        f.queue
            .add_task(TaskHandle::with_options(body, quick_retries(3)))
            .unwrap();

        eventually(|| f.queue.is_idle()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uniqueness_rules_reject_duplicates() {
        let f = fixture(1);
        let long = |unique_type| {
            TaskHandle::with_options(
                SleepyTask { steps: 500, step_ms: 2 },
                TaskOptions::new().unique(unique_type),
            )
        };

        let first = long(UniqueType::UntilProcessing);
        f.queue.add_task(first.clone()).unwrap();
        eventually(|| first.status() == TaskStatus::Running).await;

        // Running does not block UNTIL_PROCESSING, pending does.
        f.queue.add_task(long(UniqueType::UntilProcessing)).unwrap();
        let err = f.queue.add_task(long(UniqueType::UntilProcessing)).unwrap_err();
        assert!(matches!(err, TaskSystemError::UniqueViolation { .. }));

        let err = f.queue.add_task(long(UniqueType::Job)).unwrap_err();
        assert!(matches!(err, TaskSystemError::UniqueViolation { unique_key, .. } if unique_key == SleepyTask::TYPE));
        assert_eq!(f.tracker.active_count(), 2);

        let ids: Vec<TaskId> = f.tracker.get_uuids_by_tag(SleepyTask::TYPE).into_iter().collect();
        for id in ids {
            f.queue.cancel_task(id);
        }
        eventually(|| f.queue.is_idle()).await;
    }

    #[tokio::test]
    async fn same_task_cannot_be_queued_twice() {
        let f = fixture(1);
        let task = TaskHandle::new(SleepyTask { steps: 500, step_ms: 2 });
        f.queue.add_task(task.clone()).unwrap();
        assert!(matches!(
            f.queue.add_task(task.clone()),
            Err(TaskSystemError::AlreadyQueued(id)) if id == task.id()
        ));
        f.queue.cancel_task(task.id());
        eventually(|| f.queue.is_idle()).await;
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_pending_task_never_runs() {
        let f = fixture(1);
        let blocker = TaskHandle::new(SleepyTask { steps: 500, step_ms: 2 });
        let waiting = TaskHandle::new(EchoTask { value: 1 });
        f.queue.add_task(blocker.clone()).unwrap();
        f.queue.add_task(waiting.clone()).unwrap();

        assert!(f.queue.cancel_task(waiting.id()));
        assert_eq!(waiting.status(), TaskStatus::Cancelled);
        assert!(!f.tracker.contains(waiting.id()));
        assert_eq!(waiting.started_at(), None);

        f.queue.cancel_task(blocker.id());
        eventually(|| f.queue.is_idle()).await;
        assert_eq!(blocker.status(), TaskStatus::Cancelled);
        assert!(!f.queue.cancel_task(blocker.id()));
    }

    #[tokio::test]
    async fn zero_capacity_is_ignored() {
        let f = fixture(2);
        assert!(!f.queue.set_max_concurrent(0));
        assert_eq!(f.queue.max_concurrent(), 2);
        assert!(f.queue.set_max_concurrent(4));
        assert_eq!(f.queue.queue_status().max_concurrent, 4);
    }

    #[tokio::test]
    async fn persistent_pending_tasks_survive_a_restart() {
        let store = Arc::new(InMemoryStore::new());
        let first = fixture_with(Arc::clone(&store), 1);
        let blocker = TaskHandle::new(SleepyTask { steps: 500, step_ms: 2 });
        let durable = TaskHandle::with_options(EchoTask { value: 9 }, TaskOptions::new().persistent(true));
        first.queue.add_task(blocker.clone()).unwrap();
        first.queue.add_task(durable.clone()).unwrap();
        first.queue.save_state().unwrap();
        first.queue.shutdown();
        blocker.cancel();

        let saved = first.store.get(PENDING_TASKS_KEY).unwrap().unwrap();
        assert_eq!(saved.as_array().unwrap().len(), 1);

        let second = fixture_with(store, 1);
        let mut registry = TaskRegistry::new();
        registry.register::<EchoTask>().unwrap();
        assert_eq!(second.queue.load_state(&registry).unwrap(), 1);
        assert!(second.queue.contains(durable.id()));

        let restored = second.tracker.get_task(durable.id()).unwrap();
        eventually(|| second.queue.is_idle()).await;
        assert_eq!(restored.status(), TaskStatus::Completed);
        assert_eq!(restored.result(), Some(serde_json::json!(9)));
    }

    #[tokio::test]
    async fn cancelled_task_cannot_be_submitted() {
        let f = fixture(1);
        let task = TaskHandle::new(EchoTask { value: 0 });
        task.cancel();
        assert!(matches!(
            f.queue.add_task(task.clone()),
            Err(TaskSystemError::TaskCancelled(id)) if id == task.id()
        ));
        assert!(!f.tracker.contains(task.id()));
    }

    #[tokio::test]
    async fn shut_down_queue_rejects_new_tasks() {
        let f = fixture(1);
        f.queue.shutdown();
        assert!(matches!(
            f.queue.add_task(TaskHandle::new(EchoTask { value: 0 })),
            Err(TaskSystemError::ShutDown)
        ));
    }
}
