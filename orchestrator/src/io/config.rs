//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::decompose::ChunkingConfig;
use crate::core::quality::{QualityConfig, compile_patterns};

/// Directory (relative to the project) holding orchestrator state.
pub const STATE_DIR: &str = ".orchestrator";

/// Default config location for a project.
pub fn default_config_path(project: &Path) -> PathBuf {
    project.join(STATE_DIR).join("config.toml")
}

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that are
/// safe for an unattended run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Where session snapshots and task logs are written, relative to the
    /// project unless absolute.
    pub evidence_dir: PathBuf,

    /// Keep draining the queue after a task ends non-COMPLETE.
    pub continue_on_task_failure: bool,

    pub executor: ExecutorConfig,
    pub locks: LockConfig,
    pub evidence: EvidenceConfig,
    pub review: ReviewConfig,
    pub quality: QualityConfig,
    pub chunking: ChunkingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            evidence_dir: PathBuf::from(STATE_DIR).join("evidence"),
            continue_on_task_failure: false,
            executor: ExecutorConfig::default(),
            locks: LockConfig::default(),
            evidence: EvidenceConfig::default(),
            review: ReviewConfig::default(),
            quality: QualityConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.evidence_dir.as_os_str().is_empty() {
            return Err(anyhow!("evidence_dir must not be empty"));
        }
        self.executor.validate()?;
        self.locks.validate()?;
        self.evidence.validate()?;
        self.review.validate()?;
        self.quality.validate()?;
        self.chunking.validate()?;
        Ok(())
    }

    /// `evidence_dir` resolved against `project`.
    pub fn evidence_root(&self, project: &Path) -> PathBuf {
        if self.evidence_dir.is_absolute() {
            self.evidence_dir.clone()
        } else {
            project.join(&self.evidence_dir)
        }
    }
}

/// `[executor]`: the external agent process and its timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command spawned per invocation; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Hard wall-clock limit per invocation.
    pub overall_timeout_secs: u64,
    /// Kill the invocation after this long without any output.
    pub progress_timeout_secs: u64,
    /// Extra time the gate waits past `overall_timeout_secs` before giving up
    /// on an executor that ignores its own timeout.
    pub hard_timeout_grace_secs: u64,
    pub poll_interval_ms: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Output that means the agent is waiting on a human.
    pub interactive_patterns: Vec<String>,
    /// Output that means the agent is waiting for stdin.
    pub stdin_patterns: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: ["codex", "exec", "--sandbox", "workspace-write", "--skip-git-repo-check", "-"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            overall_timeout_secs: 30 * 60,
            progress_timeout_secs: 5 * 60,
            hard_timeout_grace_secs: 5,
            poll_interval_ms: 100,
            output_limit_bytes: 100_000,
            interactive_patterns: vec![
                r"(?i)\[y/n\]".to_string(),
                r"(?i)\(yes/no\)".to_string(),
                r"(?i)press (any key|enter) to continue".to_string(),
                r"(?i)do you want to (continue|proceed)\?".to_string(),
            ],
            stdin_patterns: vec![
                r"(?i)password:\s*$".to_string(),
                r"(?i)passphrase.*:\s*$".to_string(),
                r"(?i)waiting for (input|stdin)".to_string(),
            ],
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        if self.overall_timeout_secs == 0 {
            return Err(anyhow!("executor.overall_timeout_secs must be > 0"));
        }
        if self.progress_timeout_secs == 0 {
            return Err(anyhow!("executor.progress_timeout_secs must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("executor.poll_interval_ms must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        compile_patterns("executor.interactive_patterns", &self.interactive_patterns)?;
        compile_patterns("executor.stdin_patterns", &self.stdin_patterns)?;
        Ok(())
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    /// Limit enforced around a single raw invocation by the gate.
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(
            self.overall_timeout_secs
                .saturating_add(self.hard_timeout_grace_secs),
        )
    }
}

/// `[locks]`: resource locks and the executor-slot semaphore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub max_executor_slots: usize,
    /// How long the gate keeps polling for locks and a slot.
    pub acquire_timeout_ms: u64,
    pub acquire_poll_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_executor_slots: 4,
            acquire_timeout_ms: 30_000,
            acquire_poll_ms: 50,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_executor_slots == 0 {
            return Err(anyhow!("locks.max_executor_slots must be > 0"));
        }
        if self.acquire_poll_ms == 0 {
            return Err(anyhow!("locks.acquire_poll_ms must be > 0"));
        }
        Ok(())
    }
}

/// `[evidence]`: what the snapshot walk skips and how much is previewed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub excluded_dirs: Vec<String>,
    /// Bytes of each verified file kept as `content_preview`.
    pub preview_bytes: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            excluded_dirs: ["node_modules", "target", "__pycache__", "venv", "dist", "build"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            preview_bytes: 512,
        }
    }
}

impl EvidenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.excluded_dirs.iter().any(|dir| dir.trim().is_empty()) {
            return Err(anyhow!("evidence.excluded_dirs must not contain empty names"));
        }
        Ok(())
    }
}

/// `[review]`: the quality-gated review loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    pub max_iterations: u32,
    pub escalate_on_max: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            escalate_on_max: true,
        }
    }
}

impl ReviewConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("review.max_iterations must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    load_config_required(path)
}

/// Load config from a TOML file that the caller named explicitly.
pub fn load_config_required(path: &Path) -> Result<OrchestratorConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decompose::ChunkingMode;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn load_required_fails_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_config_required(&temp.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("read"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = default_config_path(temp.path());
        let mut cfg = OrchestratorConfig::default();
        cfg.chunking.mode = ChunkingMode::Parallel;
        cfg.review.max_iterations = 5;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[locks]\nmax_executor_slots = 2\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.locks.max_executor_slots, 2);
        assert_eq!(cfg.locks.acquire_poll_ms, LockConfig::default().acquire_poll_ms);
        assert_eq!(cfg.review, ReviewConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");

        fs::write(&path, "[locks]\nmax_executor_slots = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_executor_slots"));

        fs::write(&path, "[executor]\nstdin_patterns = [\"(\"]\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("executor.stdin_patterns"));
    }

    #[test]
    fn evidence_root_resolves_relative_to_project() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(
            cfg.evidence_root(Path::new("/work/app")),
            PathBuf::from("/work/app/.orchestrator/evidence")
        );
    }
}
