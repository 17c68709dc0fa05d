//! TaskRegistry - 型名 → 復元ファクトリ
//!
//! 永続化されたスナップショットの `type` から具象タスクを復元します。
//! リフレクションや動的ロードには頼らず、起動時に登録された型のみ解決します。
//!
//! # 内部実装
//! - `register::<T: Task>()` で `serde_json::from_value::<T>` ベースのファクトリを登録
//! - `TaskChain` のファクトリは組み込み（子タスクの復元に registry 自身を再帰的に使う）
//! - HashMap<String, Arc<dyn Fn>> で管理

use std::collections::HashMap;
use std::sync::Arc;

use super::body::TypedTask;
use super::task::Task;
use crate::chain::{self, TaskChain};
use crate::domain::{SerializedTask, TaskSystemError};
use crate::task::TaskHandle;

pub type TaskFactory =
    Arc<dyn Fn(&SerializedTask, &TaskRegistry) -> Result<TaskHandle, TaskSystemError> + Send + Sync>;

pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TaskRegistry {
    pub fn new() -> Self {
        let mut factories: HashMap<String, TaskFactory> = HashMap::new();
        factories.insert(TaskChain::TYPE.to_string(), Arc::new(chain::restore_chain));
        Self { factories }
    }

    pub fn register<T: Task>(&mut self) -> Result<(), RegistryError> {
        self.register_factory(T::TYPE, Arc::new(restore_typed::<T>))
    }

    pub fn register_factory(
        &mut self,
        task_type: &str,
        factory: TaskFactory,
    ) -> Result<(), RegistryError> {
        if self.factories.contains_key(task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type.to_string()));
        }
        self.factories.insert(task_type.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Sorted for stable output.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn deserialize(&self, record: &SerializedTask) -> Result<TaskHandle, TaskSystemError> {
        let factory = self
            .factories
            .get(&record.task_type)
            .ok_or_else(|| TaskSystemError::UnknownTaskType(record.task_type.clone()))?;
        factory(record, self)
    }

    /// First type in `task` (a chain's children included, depth first) with no factory.
    pub fn first_unregistered(&self, task: &TaskHandle) -> Option<String> {
        if !self.contains(task.type_name()) {
            return Some(task.type_name().to_string());
        }
        task.children().iter().find_map(|child| self.first_unregistered(child))
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn restore_typed<T: Task>(
    record: &SerializedTask,
    _registry: &TaskRegistry,
) -> Result<TaskHandle, TaskSystemError> {
    let body: T = serde_json::from_value(record.fields.clone())?;
    Ok(TaskHandle::restore(Box::new(TypedTask::new(body)), record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::task::TaskOptions;
    use crate::testing::{EchoTask, FailingTask};

    #[test]
    fn register_and_restore() {
        let mut registry = TaskRegistry::new();
        registry.register::<EchoTask>().unwrap();

        let submitted = TaskHandle::with_options(
            EchoTask { value: 42 },
            TaskOptions::named("echo").tag("demo").max_retries(2),
        );
        let record = submitted.serialize().unwrap();
        let restored = registry.deserialize(&record).unwrap();

        assert_eq!(restored.id(), submitted.id());
        assert_eq!(restored.status(), TaskStatus::Pending);
        assert_eq!(restored.tags(), submitted.tags());
        assert_eq!(restored.max_retries(), 2);
        assert_eq!(restored.body::<EchoTask>().unwrap().value, 42);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register::<EchoTask>().unwrap();
        let result = registry.register::<EchoTask>();
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == EchoTask::TYPE));
    }

    #[test]
    fn chain_factory_is_built_in() {
        let mut registry = TaskRegistry::new();
        registry.register::<FailingTask>().unwrap();
        registry.register::<EchoTask>().unwrap();
        assert_eq!(
            registry.registered_types(),
            vec![
                EchoTask::TYPE.to_string(),
                FailingTask::TYPE.to_string(),
                TaskChain::TYPE.to_string()
            ]
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = TaskRegistry::new();
        let record = TaskHandle::new(EchoTask { value: 1 }).serialize().unwrap();
        let err = registry.deserialize(&record).unwrap_err();
        assert!(matches!(err, TaskSystemError::UnknownTaskType(t) if t == EchoTask::TYPE));
    }
}
