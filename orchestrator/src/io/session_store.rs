//! Session persistence under `<evidence_dir>/sessions/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::SessionState;

const SESSION_SCHEMA: &str = include_str!("../../schemas/session/v1.schema.json");

/// Narrow persistence interface for session snapshots.
pub trait SessionStore: Send + Sync {
    fn save(&self, state: &SessionState) -> Result<()>;

    /// `Ok(None)` when no session with `session_id` was saved. `Err` when one
    /// exists but cannot be read or fails validation.
    fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
}

/// Whether `session_id` is safe to use as a file name.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// One pretty-printed JSON file per session, schema-checked on load.
pub struct FileSessionStore {
    dir: PathBuf,
    validator: Validator,
}

impl FileSessionStore {
    /// Store rooted at `<evidence_root>/sessions`.
    pub fn new(evidence_root: &Path) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(SESSION_SCHEMA).context("parse embedded session schema")?;
        let validator =
            validator_for(&schema).map_err(|err| anyhow!("invalid session schema: {}", err))?;
        Ok(Self {
            dir: evidence_root.join("sessions"),
            validator,
        })
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn validate(&self, value: &Value, path: &Path) -> Result<()> {
        if self.validator.is_valid(value) {
            return Ok(());
        }
        let messages = self
            .validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        Err(anyhow!(
            "session schema validation failed for {}: {}",
            path.display(),
            messages.join("; ")
        ))
    }
}

impl SessionStore for FileSessionStore {
    #[instrument(skip_all, fields(session_id = %state.session_id))]
    fn save(&self, state: &SessionState) -> Result<()> {
        if !is_valid_session_id(&state.session_id) {
            return Err(anyhow!("invalid session id {:?}", state.session_id));
        }
        let path = self.session_path(&state.session_id);
        debug!(path = %path.display(), tasks = state.tasks.len(), "saving session");
        let value = serde_json::to_value(state).context("serialize session")?;
        self.validate(&value, &path)?;
        let mut buf = serde_json::to_string_pretty(&value).context("serialize session")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        if !is_valid_session_id(session_id) {
            return Ok(None);
        }
        let path = self.session_path(session_id);
        if !path.exists() {
            debug!(path = %path.display(), "session not found");
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read session {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse session {}", path.display()))?;
        self.validate(&value, &path)?;
        let state: SessionState = serde_json::from_value(value)
            .with_context(|| format!("deserialize session {}", path.display()))?;
        if state.session_id != session_id {
            return Err(anyhow!(
                "session file {} holds session {}",
                path.display(),
                state.session_id
            ));
        }
        debug!(tasks = state.tasks.len(), status = ?state.status, "session loaded");
        Ok(Some(state))
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::types::{ExecutorResult, ExecutorTask, TaskOutcome, TaskStatus, VerifiedFile};

    fn sample_state() -> SessionState {
        let now = Utc::now();
        let mut state = SessionState::new(
            "session-20260101_000000-abc123".to_string(),
            PathBuf::from("/work/app"),
            now,
        );
        let task = ExecutorTask::new("task-1", "Create a.ts", PathBuf::from("/work/app"));
        let mut result = ExecutorResult::executed(PathBuf::from("/work/app"), "ok", TaskStatus::Complete);
        result.files_modified = vec!["a.ts".to_string()];
        result.verified_files = vec![VerifiedFile {
            path: "a.ts".to_string(),
            exists: true,
            size: Some(3),
            content_preview: Some("abc".to_string()),
        }];
        state.record(TaskOutcome::from_result(&task, TaskStatus::Complete, result), now);
        state
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path()).expect("store");
        let state = sample_state();
        store.save(&state).expect("save");

        assert!(store.session_path(&state.session_id).starts_with(temp.path().join("sessions")));
        let loaded = store.load(&state.session_id).expect("load").expect("present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_session_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path()).expect("store");
        assert!(store.load("session-nope").expect("load").is_none());
        assert!(store.load("../escape").expect("load").is_none());
    }

    #[test]
    fn schema_violation_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path()).expect("store");
        let path = store.session_path("session-bad");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, r#"{"session_id":"session-bad","status":"PAUSED","tasks":[]}"#)
            .expect("write");

        let err = store.load("session-bad").unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn malformed_json_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path()).expect("store");
        let path = store.session_path("session-torn");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{\"session_id\":").expect("write");
        assert!(store.load("session-torn").is_err());
    }
}
