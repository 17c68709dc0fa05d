//! Chain demo tasks: steps that talk through the chain context.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tasksys_core::{
    ChainPolicy, ChainRetryBehavior, TaskChain, TaskContext, TaskFailure, TaskHandle, TaskOptions, Task,
};
use tracing::{info, warn};

const RAW_DATA: &str = "raw_data";
const PROCESSED_DATA: &str = "processed_data";

/// Writes `count` random numbers to `raw_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataGeneratorTask {
    pub count: usize,
}

impl Task for DataGeneratorTask {
    const TYPE: &'static str = "DataGeneratorTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        ctx.set_progress(10);
        info!(task_id = %ctx.id(), count = self.count, "generating random numbers");
        ctx.sleep(Duration::from_millis(300))?;
        ctx.set_progress(50);

        let mut rng = rand::thread_rng();
        let data: Vec<i64> = (0..self.count).map(|_| rng.gen_range(1..=100)).collect();
        info!(task_id = %ctx.id(), ?data, "generated data");
        match ctx.chain_context() {
            Some(context) => context.set(RAW_DATA, &data)?,
            None => warn!(task_id = %ctx.id(), "no chain context available"),
        }
        ctx.set_progress(100);
        ctx.set_result(data)
    }
}

/// Multiplies `raw_data` into `processed_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProcessorTask {
    #[serde(default = "default_multiplier")]
    pub multiplier: i64,
}

fn default_multiplier() -> i64 {
    2
}

impl Task for DataProcessorTask {
    const TYPE: &'static str = "DataProcessorTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        ctx.set_progress(10);
        let context = ctx.chain_context();
        let raw: Vec<i64> = context
            .as_ref()
            .and_then(|context| context.get(RAW_DATA))
            .unwrap_or_default();
        if raw.is_empty() {
            return Err(TaskFailure::new("No data to process!"));
        }

        let total = raw.len();
        let mut processed = Vec::with_capacity(total);
        for (i, value) in raw.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.sleep(Duration::from_millis(100))?;
            processed.push(value * self.multiplier);
            ctx.set_progress(10 + ((i + 1) * 80 / total) as i64);
        }
        info!(task_id = %ctx.id(), ?processed, "processed data");
        if let Some(context) = context {
            context.set(PROCESSED_DATA, &processed)?;
        }
        ctx.set_progress(100);
        ctx.set_result(processed)
    }
}

/// Fails with probability `failure_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakyTask {
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
}

fn default_failure_rate() -> f64 {
    0.5
}

impl Task for FlakyTask {
    const TYPE: &'static str = "FlakyTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        ctx.set_progress(10);
        info!(task_id = %ctx.id(), failure_rate = self.failure_rate, "attempting flaky operation");
        ctx.sleep(Duration::from_millis(300))?;
        ctx.set_progress(50);
        if rand::thread_rng().gen_bool(self.failure_rate.clamp(0.0, 1.0)) {
            return Err(TaskFailure::new("Random failure occurred!"));
        }
        ctx.set_progress(100);
        ctx.set_result("Success")
    }
}

/// Fails its first `failures_before_success` attempts.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsistentlyFailingTask {
    pub failures_before_success: u32,
    #[serde(default)]
    attempts: AtomicU32,
}

impl ConsistentlyFailingTask {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            attempts: AtomicU32::new(0),
        }
    }
}

impl Task for ConsistentlyFailingTask {
    const TYPE: &'static str = "ConsistentlyFailingTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.set_progress(25);
        info!(task_id = %ctx.id(), attempt, "attempt for '{}'", ctx.name());
        ctx.sleep(Duration::from_millis(200))?;
        if attempt <= self.failures_before_success {
            ctx.set_progress(75);
            return Err(TaskFailure::new(format!("Deliberate failure #{attempt}")));
        }
        ctx.set_progress(100);
        ctx.set_result("Success after failures")
    }
}

/// Generate → flaky check (skipped on failure) → process.
pub fn demo_chain(name: &str) -> TaskHandle {
    let generate = TaskHandle::with_options(
        DataGeneratorTask { count: 5 },
        TaskOptions::named("Step 1: Generate Data"),
    );
    let check = TaskHandle::with_options(
        FlakyTask { failure_rate: 0.7 },
        TaskOptions::named("Step 2: Flaky Check")
            .max_retries(3)
            .retry_delay(Duration::from_millis(200)),
    );
    let process = TaskHandle::with_options(
        DataProcessorTask { multiplier: 10 },
        TaskOptions::named("Step 3: Process Data"),
    );

    let mut policy = ChainPolicy::new();
    policy.insert(FlakyTask::TYPE.to_string(), ChainRetryBehavior::SkipTask);
    TaskChain::build(
        TaskOptions::named(name).description("A demo chain showing context sharing and retry logic"),
        vec![generate, check, process],
        policy,
    )
}

/// Task-level retry on step 1, whole-chain retry when step 2 fails.
pub fn retry_demo_chain(name: &str) -> TaskHandle {
    let retried = TaskHandle::with_options(
        ConsistentlyFailingTask::new(2),
        TaskOptions::named("Step 1: Auto-Retry Task")
            .max_retries(2)
            .retry_delay(Duration::from_millis(300)),
    );
    let restarts = TaskHandle::with_options(
        FlakyTask { failure_rate: 0.8 },
        TaskOptions::named("Step 2: Chain-Retry Task"),
    );
    let last = TaskHandle::with_options(
        DataGeneratorTask { count: 3 },
        TaskOptions::named("Step 3: Final Step"),
    );

    let mut policy = ChainPolicy::new();
    policy.insert(FlakyTask::TYPE.to_string(), ChainRetryBehavior::RetryChain);
    policy.insert(ConsistentlyFailingTask::TYPE.to_string(), ChainRetryBehavior::RetryTask);
    TaskChain::build(
        TaskOptions::named(name)
            .description("Demonstrates task-level and chain-level retries with delays.")
            .max_retries(2)
            .retry_delay(Duration::from_millis(500)),
        vec![retried, restarts, last],
        policy,
    )
}
