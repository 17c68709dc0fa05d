//! TaskChain - 子タスクを線形に順次実行する複合タスク
//!
//! # 実行
//! - 子タスクはチェーン自身のワーカースレッド上で同期的に `run()` される（並列実行しない）
//! - 各子タスクは自身の `max_retries` まで再実行され、使い切った場合のみポリシーが適用される
//! - `current_index` は永続化され、復元後はその位置から再開する
//! - 子タスクの再実行間隔は子の `retry_delay` 固定（キューの `RetryPolicy` の倍率は掛からない）
//! - RETRY_CHAIN による先頭からの再開の前に、チェーン自身の `retry_delay` だけ RETRYING で待つ
//! - 再実行待ちの間に一時停止された場合、次の試行は再開されるまで始まらない
//!
//! # 進捗
//! 子タスク完了ごとに `(index + 1) * 100 / len` を設定する。ただし、その子の実行中に
//! `ChainProgressUpdateRequest` が届いた場合は外部の値を優先し、上書きしない。
//!
//! # キャンセル
//! `cleanup` が全ての子をキャンセルし、バスの購読を解除する。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::context::{ChainContext, ChainContextSnapshot};
use crate::domain::{
    ChainRetryBehavior, EventKind, FailureDetail, SerializedTask, TaskEvent, TaskFailure, TaskId,
    TaskStatus, TaskSystemError,
};
use crate::impls::{EventBus, SubscriptionId};
use crate::sync::lock;
use crate::task::{TaskContext, TaskHandle, TaskOptions};
use crate::typed::{DynTask, TaskRegistry};

/// Child task type name → behavior once that child has exhausted its retries.
pub type ChainPolicy = BTreeMap<String, ChainRetryBehavior>;

pub struct TaskChain {
    children: Vec<TaskHandle>,
    context: ChainContext,
    policy: ChainPolicy,
    state: Mutex<ChainState>,
    progress_overridden: Arc<AtomicBool>,
}

#[derive(Default)]
struct ChainState {
    current_index: usize,
    chain_retry_attempts: u32,
    subscription: Option<(EventBus, SubscriptionId)>,
}

/// `fields` payload of a chain snapshot.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainFields {
    tasks: Vec<SerializedTask>,
    #[serde(default)]
    current_index: usize,
    #[serde(default)]
    chain_context: Option<ChainContextSnapshot>,
    #[serde(default)]
    task_states: BTreeMap<String, TaskStatus>,
    #[serde(default)]
    retry_policy_by_task_type: BTreeMap<String, String>,
    #[serde(default)]
    chain_retry_attempts: u32,
}

/// Outcome of one child after its own retry loop.
enum ChildOutcome {
    Completed,
    Failed,
}

impl TaskChain {
    pub const TYPE: &'static str = "TaskChain";

    /// Build a chain task. Every child is linked to the chain (chain id + marker tags).
    pub fn build(options: TaskOptions, children: Vec<TaskHandle>, policy: ChainPolicy) -> TaskHandle {
        let chain_id = TaskId::generate();
        for child in &children {
            child.link_to_chain(chain_id);
        }
        let chain = Self::assemble(chain_id, children, policy, ChainContext::new(chain_id), 0, 0);
        TaskHandle::from_body(chain_id, Box::new(chain), options)
    }

    fn assemble(
        chain_id: TaskId,
        children: Vec<TaskHandle>,
        policy: ChainPolicy,
        context: ChainContext,
        current_index: usize,
        chain_retry_attempts: u32,
    ) -> Self {
        debug_assert_eq!(context.chain_id(), chain_id);
        let current_index = current_index.min(children.len());
        Self {
            children,
            context,
            policy,
            state: Mutex::new(ChainState {
                current_index,
                chain_retry_attempts,
                subscription: None,
            }),
            progress_overridden: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn children(&self) -> &[TaskHandle] {
        &self.children
    }

    pub fn context(&self) -> &ChainContext {
        &self.context
    }

    pub fn current_index(&self) -> usize {
        lock(&self.state).current_index
    }

    pub fn chain_retry_attempts(&self) -> u32 {
        lock(&self.state).chain_retry_attempts
    }

    pub fn retry_behavior(&self, task_type: &str) -> ChainRetryBehavior {
        self.policy.get(task_type).copied().unwrap_or_default()
    }

    /// The child the chain is currently executing, if any.
    pub(crate) fn active_child(&self) -> Option<&TaskHandle> {
        let child = self.children.get(self.current_index())?;
        matches!(child.status(), TaskStatus::Running | TaskStatus::Paused).then_some(child)
    }

    fn subscribe_progress(&self, chain: &TaskHandle) -> SubscriptionGuard<'_> {
        if let Some(bus) = chain.bus() {
            let chain_id = chain.id();
            let weak = chain.downgrade();
            let overridden = Arc::clone(&self.progress_overridden);
            let id = bus.subscribe(Some(EventKind::ChainProgressUpdateRequest), move |event| {
                let TaskEvent::ChainProgressUpdateRequest {
                    chain_id: target,
                    progress,
                } = event
                else {
                    return;
                };
                if *target != chain_id {
                    return;
                }
                if !(0..=100).contains(progress) {
                    warn!(chain_id = %chain_id, progress, "ignoring out-of-range chain progress");
                    return;
                }
                if let Some(task) = weak.upgrade() {
                    overridden.store(true, Ordering::SeqCst);
                    task.set_progress(*progress);
                }
            });
            lock(&self.state).subscription = Some((bus, id));
        }
        SubscriptionGuard(self)
    }

    fn release_subscription(&self) {
        let taken = lock(&self.state).subscription.take();
        if let Some((bus, id)) = taken {
            bus.unsubscribe(id);
        }
    }

    /// Run one child up to `1 + max_retries` times.
    fn execute_child(&self, chain: &TaskHandle, child: &TaskHandle) -> Result<ChildOutcome, TaskFailure> {
        let attempts = child.max_retries().saturating_add(1);
        for attempt in 1..=attempts {
            if chain.is_cancelled() {
                return Err(TaskFailure::Cancelled);
            }
            if attempt > 1 {
                child.increment_retry_attempts();
                debug!(chain_id = %chain.id(), child_id = %child.id(), attempt, "retrying chain child");
                if !chain.sleep(child.retry_delay()) {
                    return Err(TaskFailure::Cancelled);
                }
                // A pause requested during the delay holds the next attempt.
                chain.check_paused();
                if chain.is_cancelled() {
                    return Err(TaskFailure::Cancelled);
                }
            }
            child.reset_for_retry();
            match child.run() {
                TaskStatus::Completed => return Ok(ChildOutcome::Completed),
                TaskStatus::Cancelled => return Err(TaskFailure::Cancelled),
                status => {
                    warn!(
                        chain_id = %chain.id(),
                        child_id = %child.id(),
                        attempt,
                        attempts,
                        status = %status,
                        "chain child attempt failed"
                    );
                    if child.failure_is_permanent() {
                        break;
                    }
                }
            }
        }
        Ok(ChildOutcome::Failed)
    }

    fn child_failure_message(child: &TaskHandle) -> String {
        format!(
            "child task '{}' ({}) failed: {}",
            child.name(),
            child.type_name(),
            child.error().unwrap_or_default()
        )
    }

    /// Wait the chain's own retry delay before restarting from the first child.
    fn wait_before_restart(&self, chain: &TaskHandle) -> Result<(), TaskFailure> {
        if let Err(e) = chain.set_status(TaskStatus::Retrying) {
            debug!(chain_id = %chain.id(), error = %e, "chain could not enter RETRYING");
        }
        let slept = chain.sleep(chain.retry_delay());
        if !slept || chain.is_cancelled() {
            return Err(TaskFailure::Cancelled);
        }
        if let Err(e) = chain.set_status(TaskStatus::Running) {
            debug!(chain_id = %chain.id(), error = %e, "chain could not return to RUNNING");
        }
        Ok(())
    }
}

/// Releases the progress subscription however `handle` exits.
struct SubscriptionGuard<'a>(&'a TaskChain);

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.0.release_subscription();
    }
}

impl DynTask for TaskChain {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        let chain = ctx.task();
        let _subscription = self.subscribe_progress(chain);
        let total = self.children.len();

        loop {
            let index = self.current_index();
            if index >= total {
                break;
            }
            ctx.checkpoint()?;

            let child = &self.children[index];
            self.progress_overridden.store(false, Ordering::SeqCst);
            child.inject_chain_context(self.context.clone());
            info!(chain_id = %chain.id(), child_id = %child.id(), index, total, "running chain child");

            match self.execute_child(chain, child)? {
                ChildOutcome::Completed => {
                    if !self.progress_overridden.load(Ordering::SeqCst) {
                        chain.set_progress(((index + 1) * 100 / total) as i64);
                    }
                    lock(&self.state).current_index = index + 1;
                }
                ChildOutcome::Failed => match self.retry_behavior(child.type_name()) {
                    ChainRetryBehavior::SkipTask => {
                        warn!(chain_id = %chain.id(), child_id = %child.id(), "skipping failed chain child");
                        lock(&self.state).current_index = index + 1;
                    }
                    ChainRetryBehavior::RetryChain => {
                        let attempts = {
                            let mut state = lock(&self.state);
                            if state.chain_retry_attempts >= chain.max_retries() {
                                None
                            } else {
                                state.chain_retry_attempts += 1;
                                state.current_index = 0;
                                Some(state.chain_retry_attempts)
                            }
                        };
                        let Some(attempt) = attempts else {
                            // The queue must not retry a chain that already used its retries.
                            return Err(TaskFailure::Failed(FailureDetail {
                                kind: "ChainFailure".to_string(),
                                message: format!(
                                    "chain retries exhausted; {}",
                                    Self::child_failure_message(child)
                                ),
                                code: Some("CHAIN_RETRIES_EXHAUSTED".to_string()),
                                permanent: true,
                            }));
                        };
                        info!(chain_id = %chain.id(), attempt, "restarting chain from the first child");
                        self.wait_before_restart(chain)?;
                    }
                    ChainRetryBehavior::StopChain | ChainRetryBehavior::RetryTask => {
                        return Err(TaskFailure::with_kind(
                            "ChainFailure",
                            format!("chain stopped; {}", Self::child_failure_message(child)),
                        ));
                    }
                },
            }
        }

        if total == 0 {
            chain.set_progress(100);
        }
        chain.set_result(Value::Object(self.context.data()));
        Ok(())
    }

    fn cleanup(&self) {
        self.release_subscription();
        for child in &self.children {
            child.cancel();
        }
    }

    fn fields(&self) -> Result<Value, serde_json::Error> {
        let tasks = self
            .children
            .iter()
            .map(TaskHandle::serialize)
            .collect::<Result<Vec<_>, _>>()?;
        let task_states = self
            .children
            .iter()
            .map(|child| (child.id().to_string(), child.status()))
            .collect();
        let (current_index, chain_retry_attempts) = {
            let state = lock(&self.state);
            (state.current_index, state.chain_retry_attempts)
        };
        serde_json::to_value(ChainFields {
            tasks,
            current_index,
            chain_context: Some(self.context.serialize()),
            task_states,
            retry_policy_by_task_type: self
                .policy
                .iter()
                .map(|(task_type, behavior)| (task_type.clone(), behavior.as_str().to_string()))
                .collect(),
            chain_retry_attempts,
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_chain(&self) -> Option<&TaskChain> {
        Some(self)
    }
}

/// Registry factory for `TaskChain` snapshots; children resolve through the same registry.
pub(crate) fn restore_chain(
    record: &SerializedTask,
    registry: &TaskRegistry,
) -> Result<TaskHandle, TaskSystemError> {
    let fields: ChainFields = serde_json::from_value(record.fields.clone())?;

    let children = fields
        .tasks
        .iter()
        .map(|child| registry.deserialize(child))
        .collect::<Result<Vec<_>, _>>()?;
    for child in &children {
        child.link_to_chain(record.id);
    }

    let data = fields.chain_context.map(|snapshot| snapshot.data).unwrap_or_default();
    let context = ChainContext::deserialize(ChainContextSnapshot {
        chain_id: record.id,
        data,
    });
    let policy = fields
        .retry_policy_by_task_type
        .iter()
        .map(|(task_type, name)| (task_type.clone(), ChainRetryBehavior::from_name(name)))
        .collect();

    let chain = TaskChain::assemble(
        record.id,
        children,
        policy,
        context,
        fields.current_index,
        fields.chain_retry_attempts,
    );
    Ok(TaskHandle::restore(Box::new(chain), record))
}
