//! Task types shared by the unit tests.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::domain::TaskFailure;
use crate::task::TaskContext;
use crate::typed::Task;

/// Completes at once with `value` as its result.
#[derive(Debug, Serialize, Deserialize)]
pub struct EchoTask {
    pub value: i64,
}

impl Task for EchoTask {
    const TYPE: &'static str = "EchoTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        ctx.set_progress(100);
        ctx.set_result(self.value)
    }
}

/// Fails its first `failures` runs, then succeeds.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailingTask {
    pub failures: u32,
    #[serde(default)]
    pub permanent: bool,
    #[serde(skip)]
    pub runs: Arc<AtomicU32>,
}

impl FailingTask {
    pub fn times(failures: u32) -> Self {
        Self {
            failures,
            permanent: false,
            runs: Arc::default(),
        }
    }

    pub fn always() -> Self {
        Self::times(u32::MAX)
    }

    pub fn permanent() -> Self {
        Self {
            permanent: true,
            ..Self::always()
        }
    }
}

impl Task for FailingTask {
    const TYPE: &'static str = "FailingTask";

    fn handle(&self, _ctx: &TaskContext) -> Result<(), TaskFailure> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run > self.failures {
            return Ok(());
        }
        if self.permanent {
            Err(TaskFailure::permanent("E_TEST", format!("failure #{run}")))
        } else {
            Err(TaskFailure::new(format!("failure #{run}")))
        }
    }
}

/// Polls for pause/cancel between short sleeps.
#[derive(Debug, Serialize, Deserialize)]
pub struct SleepyTask {
    pub steps: u32,
    pub step_ms: u64,
}

impl Task for SleepyTask {
    const TYPE: &'static str = "SleepyTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        for step in 1..=self.steps {
            ctx.checkpoint()?;
            ctx.sleep(Duration::from_millis(self.step_ms))?;
            ctx.set_progress(i64::from(step) * 100 / i64::from(self.steps.max(1)));
        }
        Ok(())
    }
}

/// Appends its label to the chain context's `order` list.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextWriterTask {
    pub label: String,
}

impl ContextWriterTask {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

impl Task for ContextWriterTask {
    const TYPE: &'static str = "ContextWriterTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        let context = ctx
            .chain_context()
            .ok_or_else(|| TaskFailure::new("no chain context"))?;
        let mut order: Vec<String> = context.get_or("order", Vec::new());
        order.push(self.label.clone());
        context.set("order", order)?;
        Ok(())
    }
}
