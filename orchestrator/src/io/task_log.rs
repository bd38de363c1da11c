//! Per-task event logs under `<evidence_dir>/tasks/<session_id>/`.
//!
//! Product artifacts: always written, unaffected by `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::events::TimedEvent;

/// Location of the log for `task_id` in `session_id`.
pub fn task_log_path(evidence_root: &Path, session_id: &str, task_id: &str) -> PathBuf {
    evidence_root
        .join("tasks")
        .join(session_id)
        .join(format!("{task_id}.json"))
}

/// Atomically write `events` as a JSON array (temp file + rename).
pub fn write_task_log(
    evidence_root: &Path,
    session_id: &str,
    task_id: &str,
    events: &[TimedEvent],
) -> Result<PathBuf> {
    let path = task_log_path(evidence_root, session_id, task_id);
    debug!(path = %path.display(), events = events.len(), "writing task log");
    let mut buf = serde_json::to_string_pretty(events).context("serialize task log")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    Ok(path)
}

pub fn read_task_log(path: &Path) -> Result<Vec<TimedEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task log {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse task log {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("task log path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp task log {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace task log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::types::TaskStatus;
    use crate::events::Event;

    #[test]
    fn events_round_trip_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = vec![
            TimedEvent {
                timestamp: Utc::now(),
                event: Event::TaskStart {
                    task_id: "task-1".to_string(),
                },
            },
            TimedEvent {
                timestamp: Utc::now(),
                event: Event::TaskEnd {
                    task_id: "task-1".to_string(),
                    status: TaskStatus::NoEvidence,
                    skipped: false,
                },
            },
        ];

        let path = write_task_log(temp.path(), "session-1", "task-1", &events).expect("write");
        assert_eq!(path, temp.path().join("tasks/session-1/task-1.json"));
        let loaded = read_task_log(&path).expect("read");
        assert_eq!(loaded, events);

        let raw = fs::read_to_string(&path).expect("read raw");
        assert!(raw.contains("\"type\": \"TASK_END\""));
    }
}
