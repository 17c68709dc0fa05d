use serde::{Deserialize, Serialize};
use std::time::Duration;
use tasksys_core::{Task, TaskContext, TaskFailure};
use tracing::info;

/// Logs a message and walks progress through 10/30/60/100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleDemoTask {
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
}

fn default_message() -> String {
    "Task is running...".to_string()
}

fn default_step_ms() -> u64 {
    200
}

impl SimpleDemoTask {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step_ms: default_step_ms(),
        }
    }
}

impl Task for SimpleDemoTask {
    const TYPE: &'static str = "SimpleDemoTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        info!(task_id = %ctx.id(), "{}: start", ctx.name());
        ctx.set_progress(0);
        for progress in [10, 30, 60, 100] {
            ctx.checkpoint()?;
            info!(task_id = %ctx.id(), progress, "{}: {}", ctx.name(), self.message);
            ctx.set_progress(progress);
            ctx.sleep(Duration::from_millis(self.step_ms))?;
        }
        ctx.set_result(serde_json::json!({ "ok": true }))
    }
}
