//! TaskStatus - タスクの状態機械
//!
//! ```text
//! PENDING → RUNNING → {COMPLETED | FAILED | CANCELLED}
//! RUNNING → PAUSED → RUNNING
//! FAILED  → RETRYING → PENDING
//! ```
//!
//! 終端状態: COMPLETED / FAILED / CANCELLED。
//! リトライやチェーン再実行のために COMPLETED / FAILED から PENDING へのリセットを許可します。
//! CANCELLED からは抜けられません。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is an edge of the state machine.
    ///
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Running | Cancelled),
            Running => matches!(next, Completed | Failed | Cancelled | Paused | Retrying),
            Paused => matches!(next, Running | Completed | Failed | Cancelled),
            Retrying => matches!(next, Pending | Running | Failed | Cancelled),
            Completed => matches!(next, Pending),
            Failed => matches!(next, Retrying | Pending),
            Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
            Self::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::TaskStatus::*;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(Pending, Running, true)]
    #[case::cancel_pending(Pending, Cancelled, true)]
    #[case::complete(Running, Completed, true)]
    #[case::pause(Running, Paused, true)]
    #[case::resume(Paused, Running, true)]
    #[case::retry(Failed, Retrying, true)]
    #[case::requeue(Retrying, Pending, true)]
    #[case::pending_cannot_complete(Pending, Completed, false)]
    #[case::pending_cannot_pause(Pending, Paused, false)]
    #[case::cancelled_is_final(Cancelled, Pending, false)]
    #[case::completed_cannot_fail(Completed, Failed, false)]
    fn transitions_follow_the_state_machine(
        #[case] from: TaskStatus,
        #[case] to: TaskStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = [Pending, Running, Completed, Failed, Cancelled, Paused, Retrying]
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![Completed, Failed, Cancelled]);
    }

    #[test]
    fn serializes_as_upper_case_name() {
        assert_eq!(serde_json::to_string(&Retrying).unwrap(), "\"RETRYING\"");
        assert_eq!(Paused.to_string(), "PAUSED");
    }
}
