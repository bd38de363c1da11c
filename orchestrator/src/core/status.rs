//! Fail-closed status derivation and status aggregation.
//!
//! [`derive_status`] is the only place a [`TaskStatus::Complete`] can be
//! produced from an executor result. The executor's self-reported status can
//! lower the outcome but never raise it.

use crate::core::types::{ExecutorResult, TaskStatus};

/// Derive the authoritative status of `result` from its verified evidence.
///
/// Rules, first match wins:
/// - executor-reported hard error (`status = ERROR` or `error` set) -> `ERROR`
/// - blocked or not executed -> `INCOMPLETE`
/// - no existing verified file -> `NO_EVIDENCE`
/// - unverified claims alongside real evidence -> `INCOMPLETE`
/// - executor did not itself report completion -> `INCOMPLETE`
/// - otherwise `COMPLETE`
pub fn derive_status(result: &ExecutorResult) -> TaskStatus {
    if result.status == TaskStatus::Error || result.error.is_some() {
        return TaskStatus::Error;
    }
    if result.executor_blocked || !result.executed {
        return TaskStatus::Incomplete;
    }
    if !result.has_existing_evidence() {
        return TaskStatus::NoEvidence;
    }
    if !result.unverified_files.is_empty() {
        return TaskStatus::Incomplete;
    }
    if result.status != TaskStatus::Complete {
        return TaskStatus::Incomplete;
    }
    TaskStatus::Complete
}

/// Highest-precedence status in `statuses`, or `None` when empty.
pub fn worst_status<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> Option<TaskStatus> {
    statuses.into_iter().max_by_key(|status| status.severity())
}

/// Aggregate per-part statuses: `COMPLETE` iff every part is `COMPLETE`.
///
/// An empty input never counts as complete.
pub fn aggregate_statuses<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> TaskStatus {
    worst_status(statuses).unwrap_or(TaskStatus::NoEvidence)
}
