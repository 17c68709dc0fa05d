use serde::Serialize;

use crate::chain::ChainContextSnapshot;
use crate::domain::{SerializedTask, TaskId};
use crate::task::TaskHandle;

/// Read-only projection of a tracked task.
///
/// チェーンの場合は子タスクのスナップショットと ChainContext を含み、
/// チェーンの子の場合は親チェーンへの参照を含む。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    #[serde(flatten)]
    pub task: SerializedTask,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_tasks: Vec<TaskInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_context: Option<ChainContextSnapshot>,
    pub is_chain_child: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chain_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chain_name: Option<String>,
}

impl TaskInfo {
    /// Project a task. The parent chain name is filled in only for nested children;
    /// the tracker resolves it for top-level lookups.
    pub fn from_task(task: &TaskHandle) -> Self {
        let mut snapshot = task.snapshot();
        let chain = task.as_chain();
        if chain.is_some() {
            // Children are listed in `sub_tasks`.
            snapshot.fields = serde_json::Value::Null;
        }
        let sub_tasks = task
            .children()
            .iter()
            .map(|child| {
                let mut info = Self::from_task(child);
                info.parent_chain_name = Some(snapshot.name.clone());
                info
            })
            .collect();

        Self {
            parent_chain_id: task.chain_id(),
            parent_chain_name: None,
            is_chain_child: task.is_chain_child(),
            chain_context: chain.map(|c| c.context().serialize()),
            sub_tasks,
            task: snapshot,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}
