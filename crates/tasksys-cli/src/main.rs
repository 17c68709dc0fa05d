//! tasksys - タスクシステムのデモランナー
//!
//! 使い方: `tasksys [config.toml]`（ログは `RUST_LOG` で調整）

mod tasks;

use anyhow::Context;
use std::time::Duration;
use tasksys_core::{
    TaskEvent, TaskHandle, TaskManager, TaskOptions, TaskStatus, TaskSystemBuilder, TaskSystemConfig, Trigger,
};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::tasks::{AdbCommandTask, SimpleDemoTask};

const DEMO_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tasksys=info,tasksys_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn watch_events(manager: &TaskManager) {
    manager.bus().subscribe(None, |event| match event {
        TaskEvent::TaskStatusUpdated { task_id, status } => {
            info!(target: "tasksys::events", task_id = %task_id, status = %status, "status updated");
        }
        TaskEvent::TaskFinished {
            task_id,
            status: TaskStatus::Failed,
            error,
            ..
        } => {
            let message = error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
            warn!(target: "tasksys::events", task_id = %task_id, error = message, "task failed");
        }
        TaskEvent::JobExecuted { job_id, task_id } => {
            info!(target: "tasksys::events", job_id = %job_id, task_id = %task_id, "scheduled job fired");
        }
        TaskEvent::QueueStatusChanged(status) => {
            info!(
                target: "tasksys::events",
                pending = status.pending,
                running = status.running,
                retrying = status.retrying,
                "queue status"
            );
        }
        _ => {}
    });
}

async fn wait_until_idle(manager: &TaskManager) -> bool {
    let deadline = Instant::now() + DEMO_TIMEOUT;
    while Instant::now() < deadline {
        if manager.is_idle() && manager.get_scheduled_jobs().is_empty() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => TaskSystemConfig::from_file(&path).with_context(|| format!("loading {path}"))?,
        None => TaskSystemConfig::default(),
    };
    let manager = tasks::register_all(TaskSystemBuilder::new().config(config))?
        .expect_tasks(tasks::TASK_TYPES)
        .build()?;
    watch_events(&manager);

    // 1) plain task, paused and resumed through its tag
    let simple = TaskHandle::with_options(
        SimpleDemoTask::new("hello from the demo"),
        TaskOptions::named("Simple Task").tag("demo"),
    );
    manager.add_task(simple.clone(), None)?;

    // 2) chains sharing data through their context
    manager.add_task(tasks::demo_chain("Demo Chain"), None)?;
    manager.add_task(tasks::retry_demo_chain("Retry Demo Chain"), None)?;

    // 3) external command, tagged by device
    let adb = TaskHandle::with_options(
        AdbCommandTask::new("devices").timeout(5),
        TaskOptions::named("ADB devices").tag("device:any"),
    );
    manager.add_task(adb, None)?;

    // 4) one-off scheduled run
    let later = TaskHandle::with_options(
        SimpleDemoTask::new("scheduled run"),
        TaskOptions::named("Scheduled Task").tag("demo"),
    );
    let run_at = chrono::Utc::now() + chrono::Duration::seconds(2);
    manager.add_task(later, Some(Trigger::date(run_at)))?;

    sleep(Duration::from_millis(300)).await;
    let paused = manager.pause_tasks_by_tag("demo", false);
    info!(applied = paused.applied.len(), skipped = paused.skipped.len(), "paused demo tasks");
    sleep(Duration::from_millis(500)).await;
    let resumed = manager.resume_tasks_by_tag("demo", false);
    info!(applied = resumed.applied.len(), "resumed demo tasks");

    if !wait_until_idle(&manager).await {
        warn!(timeout_secs = DEMO_TIMEOUT.as_secs(), "demo did not finish in time; stopping");
        manager.stop_tasks_by_tag("demo", true);
    }

    let failed = manager.get_failed_tasks();
    println!("failed tasks: {}", failed.len());
    for record in &failed {
        println!(
            "  - {} ({}): {}",
            record["name"].as_str().unwrap_or("?"),
            record["type"].as_str().unwrap_or("?"),
            record["error"].as_str().unwrap_or("")
        );
    }
    println!("simple task finished as {}", simple.status());

    manager.shutdown();
    Ok(())
}
