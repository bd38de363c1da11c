//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the orchestration pipeline from the actual
//! agent backend (by default `codex exec`). Tests use scripted executors that
//! return predetermined results without spawning processes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{BlockedReason, ExecutorResult, ExecutorTask, TaskStatus, TerminatedBy};
use crate::core::quality::compile_patterns;
use crate::io::config::{ExecutorConfig, STATE_DIR};
use crate::io::process::{Termination, WatchOptions, run_watched_command};

pub use crate::io::process::CancelHandle;

/// Environment variable carrying the task id into the agent process.
pub const TASK_ID_ENV: &str = "ORCHESTRATOR_TASK_ID";
/// Environment variable naming where the agent may write its JSON report.
pub const REPORT_PATH_ENV: &str = "ORCHESTRATOR_REPORT_PATH";

/// Abstraction over agent execution backends.
///
/// `Err` means the executor could not be run at all. Every outcome of a run
/// that did start, including timeouts and failures, is an [`ExecutorResult`].
pub trait Executor: Send + Sync {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult>;

    /// Like [`execute`](Self::execute), but stops early once `cancel` fires.
    ///
    /// The default ignores the handle, for executors that cannot be
    /// interrupted.
    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        let _ = cancel;
        self.execute(task)
    }

    fn is_available(&self) -> bool {
        true
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        (**self).execute(task)
    }

    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        (**self).execute_cancellable(task, cancel)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        (**self).execute(task)
    }

    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        (**self).execute_cancellable(task, cancel)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Run `executor`, turning an `Err` into an ERROR result that callers can
/// judge and retry like any other failure.
pub fn execute_or_error<E: Executor + ?Sized>(
    executor: &E,
    task: &ExecutorTask,
    cancel: &CancelHandle,
) -> ExecutorResult {
    match executor.execute_cancellable(task, cancel) {
        Ok(result) => result,
        Err(err) => {
            warn!(task_id = %task.id, err = %format!("{err:#}"), "executor failed to run");
            ExecutorResult::infra_error(task.working_dir.clone(), format!("{err:#}"))
        }
    }
}

/// Optional JSON report an agent may leave at `$ORCHESTRATOR_REPORT_PATH`.
/// Advisory only: claims are verified, and the status can only lower the
/// derived one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentReport {
    pub status: Option<TaskStatus>,
    pub summary: Option<String>,
    pub files_modified: Vec<String>,
}

/// Executor that spawns `executor.command` and feeds the prompt on stdin.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    options: WatchOptions,
    cancel: CancelHandle,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let cancel = CancelHandle::new();
        let options = WatchOptions {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            output_limit_bytes: config.output_limit_bytes,
            interactive_patterns: compile_patterns(
                "executor.interactive_patterns",
                &config.interactive_patterns,
            )?,
            stdin_patterns: compile_patterns("executor.stdin_patterns", &config.stdin_patterns)?,
            cancel: vec![cancel.clone()],
            ..WatchOptions::new(
                config.overall_timeout(),
                Duration::from_secs(config.progress_timeout_secs),
            )
        };
        Ok(Self {
            config,
            options,
            cancel,
        })
    }

    /// Cancels in-flight and later invocations of this executor.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn report_path(task: &ExecutorTask) -> PathBuf {
        task.working_dir
            .join(STATE_DIR)
            .join("reports")
            .join(format!("{}.json", task.id))
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        self.execute_cancellable(task, &CancelHandle::new())
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        info!(workdir = %task.working_dir.display(), "starting executor process");

        let report_path = Self::report_path(task);
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create report dir {}", parent.display()))?;
        }
        if report_path.exists() {
            fs::remove_file(&report_path)
                .with_context(|| format!("remove stale report {}", report_path.display()))?;
        }

        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..])
            .current_dir(&task.working_dir)
            .env(TASK_ID_ENV, &task.id)
            .env(REPORT_PATH_ENV, &report_path);

        let mut options = self.options.clone();
        options.cancel.push(cancel.clone());
        let output = run_watched_command(cmd, Some(task.prompt.as_bytes()), &options)
            .with_context(|| format!("run {}", self.config.command[0]))?;
        let report = read_report(&report_path)?;

        let mut text = output.combined_text();
        if let Some(summary) = report.as_ref().and_then(|r| r.summary.as_deref()) {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(summary);
        }

        let cwd = task.working_dir.clone();
        let mut result = match output.termination {
            Some(Termination::OverallTimeout | Termination::ProgressTimeout) => ExecutorResult::blocked(
                cwd,
                text,
                Some(BlockedReason::Timeout),
                TerminatedBy::Timeout,
            ),
            Some(Termination::InteractivePrompt) => ExecutorResult::blocked(
                cwd,
                text,
                Some(BlockedReason::InteractivePrompt),
                TerminatedBy::ReplFailClosed,
            ),
            Some(Termination::StdinRequired) => ExecutorResult::blocked(
                cwd,
                text,
                Some(BlockedReason::StdinRequired),
                TerminatedBy::ReplFailClosed,
            ),
            Some(Termination::Cancelled) => {
                ExecutorResult::blocked(cwd, text, None, TerminatedBy::User)
            }
            None if !output.status.success() => {
                warn!(exit_code = ?output.status.code(), "executor process failed");
                ExecutorResult {
                    error: Some(format!(
                        "executor exited with status {:?}",
                        output.status.code()
                    )),
                    ..ExecutorResult::executed(cwd, text, TaskStatus::Error)
                }
            }
            None => {
                let status = report
                    .as_ref()
                    .and_then(|r| r.status)
                    .unwrap_or(TaskStatus::Complete);
                ExecutorResult::executed(cwd, text, status)
            }
        };
        if let Some(report) = report {
            result.files_modified = report.files_modified;
        }
        result.duration_ms = output.elapsed.as_millis() as u64;

        debug!(status = %result.status, blocked = result.executor_blocked, "executor process finished");
        Ok(result)
    }

    fn is_available(&self) -> bool {
        command_on_path(&self.config.command[0])
    }
}

fn read_report(path: &Path) -> Result<Option<AgentReport>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read agent report {}", path.display()))?;
    match serde_json::from_str(&contents) {
        Ok(report) => Ok(Some(report)),
        Err(err) => {
            // A malformed report is ignored; evidence still comes from the diff.
            warn!(path = %path.display(), err = %err, "ignoring malformed agent report");
            Ok(None)
        }
    }
}

/// Whether `program` names an existing file, directly or through `PATH`.
pub fn command_on_path(program: &str) -> bool {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| dir.join(program).is_file())
}

/// Fail with a readable error when `executor` reports itself unavailable.
pub fn require_available<E: Executor + ?Sized>(executor: &E) -> Result<()> {
    if executor.is_available() {
        return Ok(());
    }
    Err(anyhow!("executor is not available"))
}
