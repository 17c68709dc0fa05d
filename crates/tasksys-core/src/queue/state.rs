//! Queue bookkeeping: pending FIFO, running slots, retry waiters.
//!
//! State transitions of a queued task:
//! - pending -> running -> (finished)
//! - pending -> running -> waiting_retry -> pending (tail) ... until retries run out
//! - pending -> (cancelled, dropped without running)

use std::collections::{HashMap, VecDeque};
use tokio::task::JoinHandle;

use crate::domain::{TaskId, UniqueType};
use crate::observability::QueueStatus;
use crate::task::TaskHandle;

pub(crate) struct RunningEntry {
    pub(crate) task: TaskHandle,
    /// Dispatch sequence; a completion is accepted only for the matching sequence.
    pub(crate) seq: u64,
}

pub(crate) struct WaitingEntry {
    pub(crate) task: TaskHandle,
    pub(crate) timer: JoinHandle<()>,
}

pub(crate) struct QueueState {
    pub(crate) pending: VecDeque<TaskHandle>,
    pub(crate) running: HashMap<TaskId, RunningEntry>,
    pub(crate) waiting_retry: HashMap<TaskId, WaitingEntry>,
    pub(crate) max_concurrent: usize,
    next_seq: u64,
    pub(crate) shut_down: bool,
}

impl QueueState {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            running: HashMap::new(),
            waiting_retry: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
            next_seq: 0,
            shut_down: false,
        }
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.running.contains_key(&id)
            || self.waiting_retry.contains_key(&id)
            || self.pending.iter().any(|task| task.id() == id)
    }

    /// The key that blocks `task` under its uniqueness rule, if any.
    pub(crate) fn unique_conflict(&self, task: &TaskHandle) -> Option<String> {
        let scope_running = match task.unique_type() {
            UniqueType::None => return None,
            UniqueType::Job => true,
            UniqueType::UntilProcessing => false,
        };
        let key = task.unique_key();
        let in_pending = self.pending.iter().any(|other| other.unique_key() == key);
        let in_running = scope_running && self.running.values().any(|entry| entry.task.unique_key() == key);
        (in_pending || in_running).then_some(key)
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.running.len() < self.max_concurrent
    }

    /// Move the head of `pending` into a running slot.
    pub(crate) fn start_next(&mut self) -> Option<(TaskHandle, u64)> {
        let task = self.pending.pop_front()?;
        self.next_seq += 1;
        let seq = self.next_seq;
        self.running.insert(
            task.id(),
            RunningEntry {
                task: task.clone(),
                seq,
            },
        );
        Some((task, seq))
    }

    /// Release a running slot, but only for the dispatch that is still current.
    pub(crate) fn complete(&mut self, id: TaskId, seq: u64) -> Option<TaskHandle> {
        match self.running.get(&id) {
            Some(entry) if entry.seq == seq => self.running.remove(&id).map(|entry| entry.task),
            _ => None,
        }
    }

    pub(crate) fn remove_pending(&mut self, id: TaskId) -> Option<TaskHandle> {
        let index = self.pending.iter().position(|task| task.id() == id)?;
        self.pending.remove(index)
    }

    /// Tasks that should be restored after a restart: persistent ones still waiting to run.
    pub(crate) fn persistent_waiting(&self) -> Vec<TaskHandle> {
        self.pending
            .iter()
            .chain(self.waiting_retry.values().map(|entry| &entry.task))
            .filter(|task| task.is_persistent())
            .cloned()
            .collect()
    }

    pub(crate) fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.pending.len(),
            running: self.running.len(),
            max_concurrent: self.max_concurrent,
            retrying: self.waiting_retry.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::Task;
    use crate::task::TaskOptions;
    use crate::testing::EchoTask;

    fn unique(unique_type: UniqueType) -> TaskHandle {
        TaskHandle::with_options(EchoTask { value: 0 }, TaskOptions::new().unique(unique_type))
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut state = QueueState::new(1);
        let task = TaskHandle::new(EchoTask { value: 0 });
        state.pending.push_back(task.clone());

        let (started, seq) = state.start_next().unwrap();
        assert!(started.ptr_eq(&task));
        assert!(state.complete(task.id(), seq + 1).is_none());
        assert!(state.complete(task.id(), seq).is_some());
        assert!(state.complete(task.id(), seq).is_none());
    }

    #[test]
    fn job_uniqueness_covers_running_tasks() {
        let mut state = QueueState::new(1);
        state.pending.push_back(unique(UniqueType::Job));
        state.start_next();

        assert_eq!(
            state.unique_conflict(&unique(UniqueType::Job)).as_deref(),
            Some(EchoTask::TYPE)
        );
        assert_eq!(state.unique_conflict(&unique(UniqueType::UntilProcessing)), None);
        assert_eq!(state.unique_conflict(&unique(UniqueType::None)), None);
    }

    #[test]
    fn until_processing_blocks_only_pending() {
        let mut state = QueueState::new(1);
        state.pending.push_back(unique(UniqueType::UntilProcessing));
        assert!(state.unique_conflict(&unique(UniqueType::UntilProcessing)).is_some());

        let custom = TaskHandle::with_options(
            EchoTask { value: 0 },
            TaskOptions::new()
                .unique(UniqueType::UntilProcessing)
                .unique_via("device-1"),
        );
        assert!(state.unique_conflict(&custom).is_none());
    }

    #[test]
    fn capacity_is_at_least_one() {
        let state = QueueState::new(0);
        assert_eq!(state.max_concurrent, 1);
        assert!(state.has_free_slot());
    }
}
