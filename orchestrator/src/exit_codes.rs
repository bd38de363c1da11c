//! Stable exit codes for orchestrator CLI commands.

use crate::core::types::TaskStatus;

/// Every task verifiably completed.
pub const COMPLETE: i32 = 0;
/// At least one task is incomplete, blocked, skipped or needs clarification.
pub const INCOMPLETE: i32 = 1;
/// Work was reported but nothing could be verified on disk.
pub const NO_EVIDENCE: i32 = 2;
/// At least one task ended in an executor or infrastructure error.
pub const ERROR: i32 = 3;
/// Invalid arguments, config, project path or session.
pub const INVALID: i32 = 4;

/// Exit code for an aggregate task status.
pub fn for_status(status: TaskStatus) -> i32 {
    match status {
        TaskStatus::Complete => COMPLETE,
        TaskStatus::Incomplete => INCOMPLETE,
        TaskStatus::NoEvidence => NO_EVIDENCE,
        TaskStatus::Error => ERROR,
    }
}
