//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between the executor boundary, the
//! evidence verifier and the wrappers layered on top. They must not depend on
//! external state or I/O.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ambiguity::ClarificationReason;

/// Terminal status of an execution, a subtask or a whole task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Complete,
    Incomplete,
    NoEvidence,
    Error,
}

impl TaskStatus {
    /// Precedence used when aggregating: higher wins.
    ///
    /// `ERROR > INCOMPLETE > NO_EVIDENCE > COMPLETE`.
    pub fn severity(self) -> u8 {
        match self {
            TaskStatus::Complete => 0,
            TaskStatus::NoEvidence => 1,
            TaskStatus::Incomplete => 2,
            TaskStatus::Error => 3,
        }
    }

    pub fn is_complete(self) -> bool {
        self == TaskStatus::Complete
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Incomplete => "INCOMPLETE",
            TaskStatus::NoEvidence => "NO_EVIDENCE",
            TaskStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an executor invocation was forcibly stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockedReason {
    Timeout,
    InteractivePrompt,
    StdinRequired,
}

/// Who terminated a blocked executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminatedBy {
    Timeout,
    ReplFailClosed,
    User,
}

/// Immutable request handed to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorTask {
    pub id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
}

impl ExecutorTask {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            working_dir,
        }
    }

    /// Same task identity and directory with a different prompt.
    pub fn with_prompt(&self, prompt: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            prompt: prompt.into(),
            working_dir: self.working_dir.clone(),
        }
    }
}

/// A claimed or detected path after independent filesystem inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedFile {
    pub path: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
}

/// Result of one executor invocation (or an aggregate of several).
///
/// `status` is only authoritative after the evidence verifier has derived it;
/// an executor's own value is advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub executed: bool,
    pub output: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub verified_files: Vec<VerifiedFile>,
    #[serde(default)]
    pub unverified_files: Vec<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub cwd: PathBuf,
    #[serde(default)]
    pub executor_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_by: Option<TerminatedBy>,
}

impl ExecutorResult {
    /// A plain executed result carrying the executor's own claims.
    pub fn executed(cwd: PathBuf, output: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            executed: true,
            output: output.into(),
            files_modified: Vec::new(),
            verified_files: Vec::new(),
            unverified_files: Vec::new(),
            status,
            error: None,
            duration_ms: 0,
            cwd,
            executor_blocked: false,
            blocked_reason: None,
            terminated_by: None,
        }
    }

    /// Infrastructure failure: the executor could not be run at all.
    pub fn infra_error(cwd: PathBuf, message: impl Into<String>) -> Self {
        Self {
            executed: false,
            error: Some(message.into()),
            ..Self::executed(cwd, String::new(), TaskStatus::Error)
        }
    }

    /// Invocation that was forcibly terminated.
    pub fn blocked(
        cwd: PathBuf,
        output: impl Into<String>,
        reason: Option<BlockedReason>,
        terminated_by: TerminatedBy,
    ) -> Self {
        Self {
            executor_blocked: true,
            blocked_reason: reason,
            terminated_by: Some(terminated_by),
            ..Self::executed(cwd, output, TaskStatus::Incomplete)
        }
    }

    /// Verified files that actually exist on disk.
    pub fn existing_files(&self) -> impl Iterator<Item = &VerifiedFile> {
        self.verified_files.iter().filter(|file| file.exists)
    }

    pub fn has_existing_evidence(&self) -> bool {
        self.existing_files().next().is_some()
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Completed,
    Terminated,
}

/// Terminal record of one submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub clarification_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_reason: Option<ClarificationReason>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub verified_files: Vec<VerifiedFile>,
    #[serde(default)]
    pub unverified_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub executor_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_by: Option<TerminatedBy>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Review-loop iterations spent on the task.
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub escalated: bool,
    /// Never run because an earlier task failed.
    #[serde(default)]
    pub skipped: bool,
}

impl TaskOutcome {
    fn empty(task: &ExecutorTask, status: TaskStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            prompt: task.prompt.clone(),
            status,
            clarification_needed: false,
            clarification_reason: None,
            files_modified: Vec::new(),
            verified_files: Vec::new(),
            unverified_files: Vec::new(),
            error: None,
            executor_blocked: false,
            blocked_reason: None,
            terminated_by: None,
            duration_ms: 0,
            iterations: 0,
            escalated: false,
            skipped: false,
        }
    }

    /// Outcome of a task that ran, with `status` already derived.
    pub fn from_result(task: &ExecutorTask, status: TaskStatus, result: ExecutorResult) -> Self {
        Self {
            files_modified: result.files_modified,
            verified_files: result.verified_files,
            unverified_files: result.unverified_files,
            error: result.error,
            executor_blocked: result.executor_blocked,
            blocked_reason: result.blocked_reason,
            terminated_by: result.terminated_by,
            duration_ms: result.duration_ms,
            ..Self::empty(task, status)
        }
    }

    /// Task held back by the ambiguity gate.
    pub fn clarification(task: &ExecutorTask, reason: ClarificationReason, detail: String) -> Self {
        Self {
            clarification_needed: true,
            clarification_reason: Some(reason),
            error: Some(detail),
            ..Self::empty(task, TaskStatus::Incomplete)
        }
    }

    /// Task short-circuited after an earlier failure.
    pub fn skipped(task: &ExecutorTask, after: &str) -> Self {
        Self {
            skipped: true,
            error: Some(format!("skipped after task {after} did not complete")),
            ..Self::empty(task, TaskStatus::Incomplete)
        }
    }
}

/// Persisted state of one orchestration session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub status: SessionStatus,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_status: Option<TaskStatus>,
    #[serde(default)]
    pub tasks: Vec<TaskOutcome>,
}

impl SessionState {
    pub fn new(session_id: String, project_path: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            status: SessionStatus::Running,
            project_path,
            created_at: now,
            updated_at: now,
            aggregate_status: None,
            tasks: Vec::new(),
        }
    }

    /// Append `outcome` and fold its status into the aggregate.
    pub fn record(&mut self, outcome: TaskOutcome, now: DateTime<Utc>) {
        let status = outcome.status;
        self.aggregate_status = Some(match self.aggregate_status {
            Some(current) if current.severity() >= status.severity() => current,
            _ => status,
        });
        self.tasks.push(outcome);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&TaskStatus::NoEvidence).expect("serialize");
        assert_eq!(json, "\"NO_EVIDENCE\"");
        let parsed: TaskStatus = serde_json::from_str("\"ERROR\"").expect("parse");
        assert_eq!(parsed, TaskStatus::Error);
    }

    #[test]
    fn severity_orders_error_over_incomplete_over_no_evidence() {
        assert!(TaskStatus::Error.severity() > TaskStatus::Incomplete.severity());
        assert!(TaskStatus::Incomplete.severity() > TaskStatus::NoEvidence.severity());
        assert!(TaskStatus::NoEvidence.severity() > TaskStatus::Complete.severity());
    }

    #[test]
    fn blocked_result_is_never_complete() {
        let result = ExecutorResult::blocked(
            PathBuf::from("/tmp"),
            "Continue? [y/N]",
            Some(BlockedReason::InteractivePrompt),
            TerminatedBy::ReplFailClosed,
        );
        assert!(result.executor_blocked);
        assert_eq!(result.status, TaskStatus::Incomplete);
        assert_eq!(result.terminated_by, Some(TerminatedBy::ReplFailClosed));
    }

    #[test]
    fn session_aggregate_keeps_highest_precedence() {
        let now = Utc::now();
        let task = ExecutorTask::new("t", "p", PathBuf::from("/w"));
        let mut state = SessionState::new("s".to_string(), PathBuf::from("/w"), now);
        assert_eq!(state.aggregate_status, None);

        let complete = ExecutorResult::executed(PathBuf::from("/w"), "", TaskStatus::Complete);
        state.record(TaskOutcome::from_result(&task, TaskStatus::Complete, complete), now);
        assert_eq!(state.aggregate_status, Some(TaskStatus::Complete));

        state.record(TaskOutcome::skipped(&task, "t0"), now);
        assert_eq!(state.aggregate_status, Some(TaskStatus::Incomplete));

        let clarify = TaskOutcome::clarification(
            &task,
            ClarificationReason::MissingTarget,
            "no target".to_string(),
        );
        state.record(clarify, now);
        assert_eq!(state.aggregate_status, Some(TaskStatus::Incomplete));
        assert_eq!(state.tasks.len(), 3);
    }
}
