//! TaskSystemBuilder - タスクシステムの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - `expect_tasks()` で必要な task type を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェックし、不足があれば [`BuildError`]
//! - 永続化された状態（履歴・保留タスク・スケジュール）を読み込んでから `SystemReady` を発行

use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

use super::manager::TaskManager;
use crate::config::TaskSystemConfig;
use crate::domain::{TaskEvent, TaskSystemError};
use crate::impls::{EventBus, JsonFileStore};
use crate::ports::{Clock, KvStore, StoreError, SystemClock};
use crate::queue::TaskQueue;
use crate::scheduler::TaskScheduler;
use crate::tracker::Tracker;
use crate::typed::{RegistryError, Task, TaskRegistry};

/// # 使用例
/// ```ignore
/// let manager = TaskSystemBuilder::new()
///     .config(TaskSystemConfig::from_file("tasks.toml")?)
///     .register::<MyTask>()?
///     .expect_tasks(&[MyTask::TYPE])
///     .build()?;
/// ```
pub struct TaskSystemBuilder {
    config: TaskSystemConfig,
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn KvStore>>,
    bus: Option<EventBus>,
    clock: Option<Arc<dyn Clock>>,
    runtime: Option<Handle>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("no tokio runtime: build inside a runtime or pass one with `runtime()`")]
    NoRuntime,

    #[error("failed to open task storage: {0}")]
    Storage(#[from] StoreError),

    #[error("failed to load persisted state: {0}")]
    State(#[from] TaskSystemError),
}

impl TaskSystemBuilder {
    pub fn new() -> Self {
        Self {
            config: TaskSystemConfig::default(),
            registry: TaskRegistry::new(),
            expected_tasks: None,
            store: None,
            bus: None,
            clock: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: TaskSystemConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a [`JsonFileStore`] at `config.storage_path`.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing bus (e.g. one the UI already listens on).
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to the runtime `build()` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn register<T: Task>(mut self) -> Result<Self, RegistryError> {
        self.registry.register::<T>()?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<TaskManager, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|task_type| !self.registry.contains(task_type))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };
        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonFileStore::open(&self.config.storage_path)?),
        };
        let bus = self.bus.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registry = Arc::new(self.registry);

        let tracker = Arc::new(Tracker::new(
            Arc::clone(&store),
            bus.clone(),
            self.config.history_limits(),
        ));
        let queue = TaskQueue::new(
            Arc::clone(&tracker),
            bus.clone(),
            Arc::clone(&store),
            runtime.clone(),
            self.config.queue_options(),
        );
        let scheduler = TaskScheduler::new(
            queue.clone(),
            Arc::clone(&registry),
            store,
            bus.clone(),
            clock,
            runtime,
        );
        let manager = TaskManager::new(tracker, queue, scheduler, Arc::clone(&registry), bus.clone());
        manager.load_state()?;

        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            task_types = ?registry.registered_types(),
            "task system ready"
        );
        bus.publish(TaskEvent::SystemReady);
        Ok(manager)
    }
}

impl Default for TaskSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
