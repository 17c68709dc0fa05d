use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tasksys_core::{Task, TaskContext, TaskFailure};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `adb [-s serial] <command>` and records exit code, stdout and stderr.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdbCommandTask {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub device_serial: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(skip)]
    child: Mutex<Option<Child>>,
}

fn default_command() -> String {
    "devices".to_string()
}

fn default_program() -> String {
    "adb".to_string()
}

fn lock(child: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AdbCommandTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            device_serial: None,
            timeout_seconds: None,
            program: default_program(),
            child: Mutex::new(None),
        }
    }

    pub fn device(mut self, serial: impl Into<String>) -> Self {
        self.device_serial = Some(serial.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(serial) = &self.device_serial {
            args.push("-s".to_string());
            args.push(serial.clone());
        }
        args.extend(self.command.split_whitespace().map(str::to_string));
        args
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

impl Task for AdbCommandTask {
    const TYPE: &'static str = "AdbCommandTask";

    fn handle(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        let args = self.args();
        info!(task_id = %ctx.id(), program = %self.program, ?args, "running command");
        ctx.set_progress(5);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TaskFailure::with_kind("SpawnError", format!("failed to launch {}: {e}", self.program)))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        *lock(&self.child) = Some(child);

        let deadline = self.timeout_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
        let status = loop {
            let exited = {
                let mut guard = lock(&self.child);
                match guard.as_mut() {
                    Some(child) => child.try_wait()?,
                    // Taken by cleanup after cancellation.
                    None => return Err(TaskFailure::Cancelled),
                }
            };
            if let Some(status) = exited {
                break status;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                error!(task_id = %ctx.id(), timeout_seconds = ?self.timeout_seconds, "command timed out; killing it");
                if let Some(child) = lock(&self.child).as_mut() {
                    let _ = child.kill();
                }
            }
            ctx.sleep(POLL_INTERVAL)?;
        };
        lock(&self.child).take();

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let code = status.code();
        info!(task_id = %ctx.id(), exit_code = ?code, "command finished");
        ctx.set_result(serde_json::json!({
            "exitCode": code,
            "stdout": stdout,
            "stderr": stderr,
        }))?;
        ctx.set_progress(100);
        if !status.success() {
            ctx.fail(format!("ADB exited with code {}", code.unwrap_or(-1)));
        }
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(mut child) = lock(&self.child).take() {
            warn!(program = %self.program, "cancelling: killing subprocess");
            if let Err(e) = child.kill() {
                error!(error = %e, "failed to kill subprocess");
            }
            let _ = child.wait();
        }
    }
}
