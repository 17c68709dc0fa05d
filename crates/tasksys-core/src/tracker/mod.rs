//! Tracker - アクティブなタスクのレジストリ + タグ索引 + 履歴
//!
//! # 不変条件
//! - `tag_index` のどのバケットに入っている id も `active` に存在する
//!   （終了時の履歴追加と索引からの削除は同じロック区間で行う）
//! - チェーンを登録すると子タスクも登録される（子は `_ChainedChild` と `parent:<id>` タグを持つ）
//! - 登録中のタスクのタグ変更は observer 経由で索引に反映される。
//!   observer は変更されたタグをタスク側の現在値で照合し直すので、呼び出し順に依存しない
//!
//! # スレッド安全性
//! ワーカースレッド（終了処理）と制御側（一括操作・クエリ）の両方から呼ばれるため、
//! 全状態を単一の Mutex で保護する。イベントはロック解放後に発行する。

mod history;
mod info;

pub use self::info::TaskInfo;

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use self::history::BoundedHistory;
use crate::domain::{TaskEvent, TaskId, TaskStatus, TaskSystemError};
use crate::impls::EventBus;
use crate::ports::KvStore;
use crate::sync::lock;
use crate::task::TaskHandle;
use crate::task::handle::TagObserver;

pub const FAILED_HISTORY_KEY: &str = "failedTaskHistory";
pub const COMPLETED_HISTORY_KEY: &str = "completedTaskHistory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub failed: usize,
    pub completed: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            failed: 1000,
            completed: 1000,
        }
    }
}

struct TrackerState {
    active: HashMap<TaskId, TaskHandle>,
    tag_index: HashMap<String, HashSet<TaskId>>,
    /// chain child id → chain id
    parents: HashMap<TaskId, TaskId>,
    failed_history: BoundedHistory,
    completed_history: BoundedHistory,
}

impl TrackerState {
    fn insert(&mut self, task: &TaskHandle) {
        let id = task.id();
        for tag in task.tags() {
            self.tag_index.entry(tag).or_default().insert(id);
        }
        self.active.insert(id, task.clone());
    }

    /// Bring one `(task, tag)` pair of the index in line with the task's current tags.
    fn resync_tag(&mut self, id: TaskId, tag: &str) {
        let Some(task) = self.active.get(&id) else {
            return;
        };
        if task.has_tag(tag) {
            self.tag_index.entry(tag.to_string()).or_default().insert(id);
        } else if let Some(bucket) = self.tag_index.get_mut(tag) {
            bucket.remove(&id);
            if bucket.is_empty() {
                self.tag_index.remove(tag);
            }
        }
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskHandle> {
        let task = self.active.remove(&id)?;
        task.set_tag_observer(None);
        for bucket in self.tag_index.values_mut() {
            bucket.remove(&id);
        }
        self.tag_index.retain(|_, bucket| !bucket.is_empty());
        self.parents.remove(&id);
        for child in task.children() {
            self.remove(child.id());
        }
        Some(task)
    }

    fn parent_name(&self, child: TaskId) -> Option<String> {
        let parent = self.parents.get(&child)?;
        self.active.get(parent).map(TaskHandle::name)
    }
}

pub struct Tracker {
    state: Arc<Mutex<TrackerState>>,
    store: Arc<dyn KvStore>,
    bus: EventBus,
}

impl Tracker {
    pub fn new(store: Arc<dyn KvStore>, bus: EventBus, limits: HistoryLimits) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                active: HashMap::new(),
                tag_index: HashMap::new(),
                parents: HashMap::new(),
                failed_history: BoundedHistory::new(limits.failed),
                completed_history: BoundedHistory::new(limits.completed),
            })),
            store,
            bus,
        }
    }

    /// Register a task (and, for a chain, every child).
    ///
    /// Returns `false` if the id was already tracked.
    pub fn add_task(&self, task: &TaskHandle) -> bool {
        {
            let mut state = lock(&self.state);
            if state.active.contains_key(&task.id()) {
                warn!(task_id = %task.id(), "task is already tracked");
                return false;
            }
            // Observer first: a tag change racing with the insert is either read by
            // `insert` or resynced right after it.
            let observer = self.tag_observer();
            task.set_tag_observer(Some(Arc::clone(&observer)));
            state.insert(task);
            for child in task.children() {
                child.set_tag_observer(Some(Arc::clone(&observer)));
                state.insert(child);
                state.parents.insert(child.id(), task.id());
            }
        }
        debug!(task_id = %task.id(), task_type = task.type_name(), "task tracked");
        self.bus.publish(TaskEvent::TaskAdded { task_id: task.id() });
        true
    }

    fn tag_observer(&self) -> TagObserver {
        let state: Weak<Mutex<TrackerState>> = Arc::downgrade(&self.state);
        Arc::new(move |id, tag| {
            if let Some(state) = state.upgrade() {
                lock(&state).resync_tag(id, tag);
            }
        })
    }

    /// Drop a task (and its chain children) from the registry and the tag index.
    pub fn remove_task(&self, id: TaskId) -> Result<TaskHandle, TaskSystemError> {
        let removed = lock(&self.state).remove(id);
        let task = removed.ok_or(TaskSystemError::TaskNotFound(id))?;
        self.bus.publish(TaskEvent::TaskRemoved { task_id: id });
        Ok(task)
    }

    /// Terminal bookkeeping: history record (if any) and removal in one step.
    pub fn finish_task(&self, task: &TaskHandle) {
        let status = task.status();
        let mut failure = None;
        let mut recorded = false;
        let removed = {
            let mut state = lock(&self.state);
            match status {
                TaskStatus::Failed => {
                    let record = history_record(task, "failedAt");
                    state.failed_history.push(record.clone());
                    failure = Some(record);
                    recorded = true;
                }
                TaskStatus::Completed if task.is_persistent() => {
                    state.completed_history.push(history_record(task, "completedAt"));
                    recorded = true;
                }
                _ => {}
            }
            state.remove(task.id()).is_some()
        };

        if recorded {
            self.persist_history();
        }
        if let Some(record) = failure {
            self.bus.publish(TaskEvent::FailedTaskLogged { record });
        }
        if removed {
            self.bus.publish(TaskEvent::TaskRemoved { task_id: task.id() });
        }
    }

    /// Append a failure record to the bounded history and persist it.
    pub fn log_failed_task(&self, task: &TaskHandle) {
        let record = history_record(task, "failedAt");
        lock(&self.state).failed_history.push(record.clone());
        self.persist_history();
        self.bus.publish(TaskEvent::FailedTaskLogged { record });
    }

    pub fn get_task(&self, id: TaskId) -> Option<TaskHandle> {
        lock(&self.state).active.get(&id).cloned()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        lock(&self.state).active.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state).active.len()
    }

    pub fn get_task_info(&self, id: TaskId) -> Result<TaskInfo, TaskSystemError> {
        let (task, parent_name) = {
            let state = lock(&self.state);
            let task = state
                .active
                .get(&id)
                .cloned()
                .ok_or(TaskSystemError::TaskNotFound(id))?;
            (task, state.parent_name(id))
        };
        let mut info = task.info();
        info.parent_chain_name = parent_name;
        Ok(info)
    }

    /// Every tracked task, oldest first. Chain children appear only nested in their chain
    /// unless `include_chain_children` is set.
    pub fn get_all_tasks_info(&self, include_chain_children: bool) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskHandle> = {
            let state = lock(&self.state);
            state
                .active
                .values()
                .filter(|task| include_chain_children || !state.parents.contains_key(&task.id()))
                .cloned()
                .collect()
        };
        tasks.sort_by_key(TaskHandle::created_at);
        tasks.iter().filter_map(|task| self.get_task_info(task.id()).ok()).collect()
    }

    pub fn get_uuids_by_tag(&self, tag: &str) -> HashSet<TaskId> {
        lock(&self.state).tag_index.get(tag).cloned().unwrap_or_default()
    }

    pub fn get_tasks_by_tag(&self, tag: &str) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self
            .get_uuids_by_tag(tag)
            .into_iter()
            .filter_map(|id| self.get_task_info(id).ok())
            .collect();
        infos.sort_by_key(|info| info.task.created_at);
        infos
    }

    pub fn has_tasks_with_tag(&self, tag: &str) -> bool {
        lock(&self.state)
            .tag_index
            .get(tag)
            .is_some_and(|bucket| !bucket.is_empty())
    }

    pub fn is_chain_child(&self, id: TaskId) -> bool {
        let state = lock(&self.state);
        state.parents.contains_key(&id) || state.active.get(&id).is_some_and(TaskHandle::is_chain_child)
    }

    pub fn failed_tasks(&self) -> Vec<Value> {
        lock(&self.state).failed_history.to_vec()
    }

    pub fn completed_tasks(&self) -> Vec<Value> {
        lock(&self.state).completed_history.to_vec()
    }

    /// Restore both histories. Entries that are not JSON objects are skipped.
    pub fn load_state(&self) -> Result<(), TaskSystemError> {
        let failed = self.load_history(FAILED_HISTORY_KEY)?;
        let completed = self.load_history(COMPLETED_HISTORY_KEY)?;
        let mut state = lock(&self.state);
        state.failed_history.restore(failed);
        state.completed_history.restore(completed);
        debug!(
            failed = state.failed_history.len(),
            completed = state.completed_history.len(),
            "tracker history restored"
        );
        Ok(())
    }

    pub fn save_state(&self) -> Result<(), TaskSystemError> {
        let (failed, completed) = {
            let state = lock(&self.state);
            (state.failed_history.to_value(), state.completed_history.to_value())
        };
        self.store.set(FAILED_HISTORY_KEY, failed)?;
        self.store.set(COMPLETED_HISTORY_KEY, completed)?;
        self.store.flush()?;
        Ok(())
    }

    fn load_history(&self, key: &str) -> Result<Vec<Value>, TaskSystemError> {
        let records = match self.store.get(key)? {
            None => Vec::new(),
            Some(Value::Array(records)) => records,
            Some(other) => {
                warn!(key, kind = json_kind(&other), "ignoring malformed history");
                Vec::new()
            }
        };
        Ok(records
            .into_iter()
            .filter(|record| {
                let ok = record.is_object();
                if !ok {
                    warn!(key, "skipping malformed history record");
                }
                ok
            })
            .collect())
    }

    fn persist_history(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to persist task history");
        }
    }
}

fn history_record(task: &TaskHandle, stamp_key: &str) -> Value {
    let mut record = match task.snapshot().to_value() {
        Ok(value) => value,
        Err(e) => {
            warn!(task_id = %task.id(), error = %e, "history record could not be encoded");
            serde_json::json!({ "id": task.id(), "name": task.name(), "error": task.error() })
        }
    };
    if let Value::Object(map) = &mut record {
        map.insert(stamp_key.to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    record
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
