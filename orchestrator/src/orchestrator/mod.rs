//! Orchestrator core: session lifecycle and the per-task pipeline.
//!
//! Every task passes the ambiguity gate and then runs through
//! `ChunkingExecutor<ReviewLoopExecutor<GatedExecutor<E>>>`. The gate holds
//! locks and an executor slot around each raw invocation and replaces the
//! executor's claims with filesystem evidence; the final status is
//! re-derived from that evidence before it is recorded.

pub mod gate;
pub mod queue;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::chunking::ChunkingExecutor;
use crate::core::ambiguity::{GateDecision, evaluate_prompt};
use crate::core::quality::Checklist;
use crate::core::status::{aggregate_statuses, derive_status};
use crate::core::types::{ExecutorTask, SessionState, SessionStatus, TaskOutcome, TaskStatus};
use crate::events::{Event, EventHub, EventSink, TimedEvent};
use crate::io::config::{OrchestratorConfig, default_config_path, load_config, load_config_required};
use crate::io::executor::{Executor, require_available};
use crate::io::prompt::{FeedbackPromptAssembler, PromptAssembler};
use crate::io::session_store::{FileSessionStore, SessionStore, is_valid_session_id};
use crate::io::sleep::{Sleeper, ThreadSleeper};
use crate::io::task_log::write_task_log;
use crate::locks::LockManager;
use crate::review::ReviewLoopExecutor;

pub use gate::{GatedExecutor, lock_plan};
pub use queue::{TaskQueueHandle, TaskRequest};

use queue::TaskQueue;

/// Typed session failures; callers `downcast_ref` them out of `anyhow`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("no active session (call initialize or resume first)")]
    NoActiveSession,
}

/// Tasks to run in one [`Orchestrator::execute`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecuteRequest {
    pub tasks: Vec<TaskRequest>,
}

impl ExecuteRequest {
    pub fn new<I, S>(prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: prompts.into_iter().map(TaskRequest::new).collect(),
        }
    }
}

/// Outcome of one [`Orchestrator::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateResult {
    pub session_id: String,
    /// Precedence-aggregated status of `tasks`.
    pub status: TaskStatus,
    /// Terminal records of the tasks drained by this call, in run order.
    pub tasks: Vec<TaskOutcome>,
    /// Set when the session snapshot could not be saved after the drain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

/// Project-bound state resolved by [`Orchestrator::attach`].
struct Attached {
    project: PathBuf,
    evidence_root: PathBuf,
    config: OrchestratorConfig,
    checklist: Arc<Checklist>,
    locks: Arc<LockManager>,
    store: Arc<dyn SessionStore>,
}

/// Composes locks, evidence, review and chunking into one task pipeline and
/// owns the session lifecycle.
pub struct Orchestrator<E> {
    executor: Arc<E>,
    hub: Arc<EventHub>,
    queue: TaskQueue,
    assembler: Arc<dyn PromptAssembler>,
    sleeper: Arc<dyn Sleeper>,
    config_override: Option<OrchestratorConfig>,
    config_path: Option<PathBuf>,
    locks_override: Option<Arc<LockManager>>,
    store_override: Option<Arc<dyn SessionStore>>,
    attached: Option<Attached>,
    session: Option<SessionState>,
}

impl<E: Executor + 'static> Orchestrator<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
            hub: Arc::new(EventHub::new()),
            queue: TaskQueue::default(),
            assembler: Arc::new(FeedbackPromptAssembler::new()),
            sleeper: Arc::new(ThreadSleeper),
            config_override: None,
            config_path: None,
            locks_override: None,
            store_override: None,
            attached: None,
            session: None,
        }
    }

    /// Use `config` instead of loading one from disk.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config_override = Some(config);
        self
    }

    /// Load config from `path`, which must exist.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Share a lock manager (and its slot bound) with other orchestrators.
    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks_override = Some(locks);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store_override = Some(store);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn PromptAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    /// Bind to `project_path` without creating a session: validate the
    /// directory, load config, and open the session store.
    #[instrument(skip_all, fields(project = %project_path.display()))]
    pub fn attach(&mut self, project_path: &Path) -> Result<()> {
        if !project_path.is_dir() {
            bail!("project path {} is not a directory", project_path.display());
        }
        let project = project_path
            .canonicalize()
            .with_context(|| format!("resolve project path {}", project_path.display()))?;

        let config = match (&self.config_override, &self.config_path) {
            (Some(config), _) => {
                config.validate()?;
                config.clone()
            }
            (None, Some(path)) => load_config_required(path)?,
            (None, None) => load_config(&default_config_path(&project))?,
        };
        let evidence_root = config.evidence_root(&project);
        let checklist = Arc::new(Checklist::standard(&config.quality)?);
        let locks = self
            .locks_override
            .clone()
            .unwrap_or_else(|| Arc::new(LockManager::new(config.locks.max_executor_slots)));
        let store: Arc<dyn SessionStore> = match &self.store_override {
            Some(store) => Arc::clone(store),
            None => Arc::new(FileSessionStore::new(&evidence_root)?),
        };

        debug!(evidence_root = %evidence_root.display(), "attached to project");
        self.attached = Some(Attached {
            project,
            evidence_root,
            config,
            checklist,
            locks,
            store,
        });
        Ok(())
    }

    /// Attach to `project_path` and start a new RUNNING session.
    pub fn initialize(&mut self, project_path: &Path) -> Result<SessionState> {
        self.attach(project_path)?;
        let attached = self.attached()?;
        let now = Utc::now();
        let state = SessionState::new(new_session_id(now), attached.project.clone(), now);
        attached.store.save(&state)?;
        info!(session_id = %state.session_id, "session started");

        self.hub.emit(&Event::SessionStart {
            session_id: state.session_id.clone(),
        });
        self.session = Some(state.clone());
        Ok(state)
    }

    /// Make a persisted session current again.
    ///
    /// Fails with [`SessionError::NotFound`] or [`SessionError::Corrupt`]
    /// without touching the current session.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn resume(&mut self, session_id: &str) -> Result<SessionState> {
        let attached = self.attached()?;
        if !is_valid_session_id(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()).into());
        }
        let mut state = match attached.store.load(session_id) {
            Ok(Some(state)) => state,
            Ok(None) => return Err(SessionError::NotFound(session_id.to_string()).into()),
            Err(err) => {
                return Err(SessionError::Corrupt {
                    id: session_id.to_string(),
                    reason: format!("{err:#}"),
                }
                .into());
            }
        };
        if state.project_path != attached.project {
            warn!(
                saved = %state.project_path.display(),
                current = %attached.project.display(),
                "resuming session recorded for a different project path"
            );
        }

        state.status = SessionStatus::Running;
        state.updated_at = Utc::now();
        attached.store.save(&state)?;
        info!(tasks = state.tasks.len(), "session resumed");

        self.hub.emit(&Event::SessionStart {
            session_id: state.session_id.clone(),
        });
        self.session = Some(state.clone());
        Ok(state)
    }

    /// Enqueue `request` and drain the queue, one task at a time.
    #[instrument(skip_all, fields(tasks = request.tasks.len()))]
    pub fn execute(&mut self, request: ExecuteRequest) -> Result<AggregateResult> {
        match &self.session {
            Some(state) if state.status == SessionStatus::Running => {}
            _ => return Err(SessionError::NoActiveSession.into()),
        }
        for task in &request.tasks {
            if let Some(id) = task.id.as_deref().filter(|id| !is_valid_session_id(id)) {
                bail!("invalid task id {id:?}: use letters, digits, '-' or '_'");
            }
        }
        require_available(self.executor.as_ref())?;
        let mut reserved: HashSet<String> = request
            .tasks
            .iter()
            .filter_map(|task| task.id.clone())
            .collect();
        for task in request.tasks {
            self.queue.push(task);
        }
        if self.queue.is_empty() {
            bail!("no tasks to execute");
        }

        let attached = self.attached()?;
        let config = attached.config.clone();
        let sink: Arc<dyn EventSink> = self.hub.clone();
        let gated = GatedExecutor::new(
            Arc::clone(&self.executor),
            Arc::clone(&attached.locks),
            config.locks.clone(),
            config.evidence.clone(),
            config.executor.hard_timeout(),
        );
        let review = ReviewLoopExecutor::new(gated, config.review.clone(), Arc::clone(&attached.checklist))
            .with_assembler(Arc::clone(&self.assembler))
            .with_sink(Arc::clone(&sink));
        let pipeline = ChunkingExecutor::new(review, config.chunking.clone())
            .with_sleeper(Arc::clone(&self.sleeper))
            .with_sink(sink);

        let mut outcomes = Vec::new();
        let mut failed_task: Option<String> = None;
        let mut unsaved = false;
        while let Some(request) = self.queue.pop() {
            let task = self.task_for(request, &mut reserved)?;
            let outcome = match &failed_task {
                Some(failed) => self.skip_task(&task, failed),
                None => self.run_task(&pipeline, &task),
            };
            if !outcome.status.is_complete()
                && !config.continue_on_task_failure
                && failed_task.is_none()
            {
                warn!(task_id = %task.id, status = %outcome.status, "short-circuiting remaining tasks");
                failed_task = Some(task.id.clone());
            }
            if let Err(err) = self.record(outcome.clone()) {
                warn!(task_id = %task.id, err = %format!("{err:#}"), "failed to save session, continuing");
                unsaved = true;
            }
            outcomes.push(outcome);
        }

        let persistence_error = if unsaved {
            self.persist().err().map(|err| {
                warn!(err = %format!("{err:#}"), "session snapshot is stale");
                format!("{err:#}")
            })
        } else {
            None
        };
        let session_id = self.session_id()?;
        let status = aggregate_statuses(outcomes.iter().map(|o| o.status));
        info!(tasks = outcomes.len(), status = %status, "queue drained");
        Ok(AggregateResult {
            session_id,
            status,
            tasks: outcomes,
            persistence_error,
        })
    }

    /// Terminal records of every task in the current session.
    pub fn get_task_results(&self) -> Vec<TaskOutcome> {
        self.session
            .as_ref()
            .map(|state| state.tasks.clone())
            .unwrap_or_default()
    }

    pub fn get_session_state(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    /// Subscribe to events named `name` (`"*"` for all).
    pub fn on<F>(&self, name: &str, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.hub.on(name, callback);
    }

    /// Producer handle for submitting tasks from other threads.
    pub fn queue_handle(&self) -> TaskQueueHandle {
        self.queue.handle()
    }

    /// Lock manager in use; `None` before [`attach`](Self::attach).
    pub fn lock_manager(&self) -> Option<Arc<LockManager>> {
        self.attached.as_ref().map(|a| Arc::clone(&a.locks))
    }

    /// Directory holding session snapshots and task logs.
    pub fn evidence_root(&self) -> Option<&Path> {
        self.attached.as_ref().map(|a| a.evidence_root.as_path())
    }

    /// End the session and persist it. Idempotent.
    ///
    /// The session becomes COMPLETED when it recorded at least one task and
    /// every task completed, TERMINATED otherwise.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(state) = self.session.as_mut() else {
            return Ok(());
        };
        if state.status != SessionStatus::Running {
            return Ok(());
        }
        let all_complete =
            !state.tasks.is_empty() && state.tasks.iter().all(|task| task.status.is_complete());
        state.status = if all_complete {
            SessionStatus::Completed
        } else {
            SessionStatus::Terminated
        };
        state.updated_at = Utc::now();
        let snapshot = state.clone();
        self.attached()?.store.save(&snapshot)?;
        info!(session_id = %snapshot.session_id, status = ?snapshot.status, "session ended");
        self.hub.emit(&Event::SessionEnd {
            session_id: snapshot.session_id,
            aggregate_status: snapshot.aggregate_status,
        });
        Ok(())
    }

    fn attached(&self) -> Result<&Attached> {
        self.attached
            .as_ref()
            .ok_or_else(|| anyhow!("orchestrator is not attached to a project (call initialize first)"))
    }

    fn session_id(&self) -> Result<String> {
        self.session
            .as_ref()
            .map(|state| state.session_id.clone())
            .ok_or_else(|| SessionError::NoActiveSession.into())
    }

    /// Resolve the task id: the caller's, or `task-<n>` numbered after the
    /// recorded tasks and skipping any id already recorded or `reserved`.
    fn task_for(&self, request: TaskRequest, reserved: &mut HashSet<String>) -> Result<ExecutorTask> {
        let attached = self.attached()?;
        let recorded = self.session.as_ref().map_or(&[][..], |state| state.tasks.as_slice());
        let id = match request.id {
            Some(id) => id,
            None => {
                let taken = |id: &str| reserved.contains(id) || recorded.iter().any(|t| t.task_id == id);
                let id = (recorded.len() + 1..)
                    .map(|n| format!("task-{n}"))
                    .find(|id| !taken(id))
                    .ok_or_else(|| anyhow!("no free task id"))?;
                reserved.insert(id.clone());
                id
            }
        };
        Ok(ExecutorTask::new(id, request.prompt, attached.project.clone()))
    }

    fn run_task<P: Executor + 'static>(
        &self,
        pipeline: &ChunkingExecutor<P>,
        task: &ExecutorTask,
    ) -> TaskOutcome {
        self.hub.start_recording();
        self.hub.emit(&Event::TaskStart {
            task_id: task.id.clone(),
        });

        let decision = evaluate_prompt(&task.prompt, |target| task.working_dir.join(target).exists());
        let mut outcome = match decision {
            GateDecision::Clarify { reason, detail } => {
                info!(task_id = %task.id, ?reason, "task needs clarification");
                self.hub.emit(&Event::ClarificationNeeded {
                    task_id: task.id.clone(),
                    reason,
                    detail: detail.clone(),
                });
                TaskOutcome::clarification(task, reason, detail)
            }
            GateDecision::Proceed { targets } => {
                debug!(task_id = %task.id, targets = ?targets, "task resolved");
                let result = pipeline.execute_task(task);
                // Wrappers may only lower a status; COMPLETE must still hold
                // against the evidence.
                let status = if result.status.is_complete() {
                    derive_status(&result)
                } else {
                    result.status
                };
                TaskOutcome::from_result(task, status, result)
            }
        };

        self.hub.emit(&Event::TaskEnd {
            task_id: task.id.clone(),
            status: outcome.status,
            skipped: false,
        });
        let events = self.hub.take_recording();
        outcome.iterations = events
            .iter()
            .filter(|e| matches!(e.event, Event::IterationStart { .. }))
            .count() as u32;
        outcome.escalated = events
            .iter()
            .any(|e| matches!(e.event, Event::Escalate { .. }));
        self.write_log(&task.id, &events);
        info!(task_id = %task.id, status = %outcome.status, iterations = outcome.iterations, "task finished");
        outcome
    }

    fn skip_task(&self, task: &ExecutorTask, failed: &str) -> TaskOutcome {
        self.hub.start_recording();
        self.hub.emit(&Event::TaskStart {
            task_id: task.id.clone(),
        });
        let outcome = TaskOutcome::skipped(task, failed);
        self.hub.emit(&Event::TaskEnd {
            task_id: task.id.clone(),
            status: outcome.status,
            skipped: true,
        });
        let events = self.hub.take_recording();
        self.write_log(&task.id, &events);
        outcome
    }

    fn write_log(&self, task_id: &str, events: &[TimedEvent]) {
        let (Ok(attached), Some(state)) = (self.attached(), self.session.as_ref()) else {
            return;
        };
        if let Err(err) = write_task_log(&attached.evidence_root, &state.session_id, task_id, events) {
            warn!(task_id, err = %format!("{err:#}"), "failed to write task log");
        }
    }

    fn record(&mut self, outcome: TaskOutcome) -> Result<()> {
        let store = Arc::clone(&self.attached()?.store);
        let state = self
            .session
            .as_mut()
            .ok_or(SessionError::NoActiveSession)?;
        state.record(outcome, Utc::now());
        store.save(state)
    }

    fn persist(&self) -> Result<()> {
        let state = self.session.as_ref().ok_or(SessionError::NoActiveSession)?;
        self.attached()?.store.save(state)
    }
}

/// `session-<YYYYmmdd_HHMMSS>-<6 lowercase alphanumerics>`.
fn new_session_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let short: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("session-{}-{short}", now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use regex::Regex;

    use super::*;
    use crate::core::types::ExecutorResult;
    use crate::test_support::{FnExecutor, MemorySessionStore, RecordingSleeper, ScriptedExecutor};

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.locks.acquire_timeout_ms = 200;
        config.locks.acquire_poll_ms = 10;
        config
    }

    fn orchestrator<X: Executor + 'static>(executor: X) -> Orchestrator<X> {
        Orchestrator::new(executor)
            .with_config(config())
            .with_store(Arc::new(MemorySessionStore::default()))
            .with_sleeper(Arc::new(RecordingSleeper::default()))
    }

    /// Writes `<task id>.txt` so every run leaves evidence.
    fn writing_executor() -> impl Executor + 'static {
        FnExecutor::new(|task: &ExecutorTask| {
            std::fs::write(task.working_dir.join(format!("{}.txt", task.id)), "x").expect("write");
            Ok(ExecutorResult::executed(task.working_dir.clone(), "done", TaskStatus::Complete))
        })
    }

    #[test]
    fn session_id_has_timestamp_and_short_suffix() {
        let id = new_session_id(Utc::now());
        let re = Regex::new(r"^session-\d{8}_\d{6}-[a-z0-9]{6}$").expect("regex");
        assert!(re.is_match(&id), "unexpected id {id}");
    }

    #[test]
    fn initialize_rejects_missing_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(ScriptedExecutor::new(Vec::new()));
        let err = orch.initialize(&temp.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
        assert!(orch.get_session_state().is_none());
    }

    #[test]
    fn execute_without_session_is_typed_error() {
        let mut orch = orchestrator(ScriptedExecutor::new(Vec::new()));
        let err = orch.execute(ExecuteRequest::new(["Fix a.rs"])).unwrap_err();
        assert!(matches!(err.downcast_ref::<SessionError>(), Some(SessionError::NoActiveSession)));
    }

    #[test]
    fn empty_queue_and_unavailable_executor_are_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(ScriptedExecutor::new(Vec::new()));
        orch.initialize(temp.path()).expect("init");
        let err = orch.execute(ExecuteRequest::default()).unwrap_err();
        assert!(err.to_string().contains("no tasks"));

        let mut orch = orchestrator(ScriptedExecutor::unavailable());
        orch.initialize(temp.path()).expect("init");
        let err = orch.execute(ExecuteRequest::new(["Fix a.rs"])).unwrap_err();
        assert!(err.to_string().contains("not available"));
        assert!(orch.queue.is_empty());
    }

    #[test]
    fn ambiguous_task_never_reaches_executor() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(ScriptedExecutor::new(Vec::new()));
        orch.initialize(temp.path()).expect("init");
        let clarifications = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&clarifications);
        orch.on("CLARIFICATION_NEEDED", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let result = orch
            .execute(ExecuteRequest::new(["Create a new helper module"]))
            .expect("execute");
        assert_eq!(result.status, TaskStatus::Incomplete);
        assert!(result.tasks[0].clarification_needed);
        assert_eq!(orch.executor.calls(), 0);
        assert_eq!(clarifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_ids_follow_session_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ids = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&ids);
        let executor = FnExecutor::new(move |task: &ExecutorTask| {
            record.lock().expect("lock").push(task.id.clone());
            std::fs::write(task.working_dir.join(format!("{}.txt", task.id)), "x").expect("write");
            Ok(ExecutorResult::executed(task.working_dir.clone(), "done", TaskStatus::Complete))
        });
        let mut orch = orchestrator(executor);
        orch.initialize(temp.path()).expect("init");

        orch.execute(ExecuteRequest::new(["Tidy up one"])).expect("first");
        orch.execute(ExecuteRequest {
            tasks: vec![TaskRequest::new("Tidy up two").with_id("custom_id")],
        })
        .expect("second");
        orch.execute(ExecuteRequest::new(["Tidy up three"])).expect("third");

        let results: Vec<String> = orch.get_task_results().into_iter().map(|t| t.task_id).collect();
        assert_eq!(results, vec!["task-1", "custom_id", "task-3"]);
        assert_eq!(*ids.lock().expect("lock"), results);
    }

    #[test]
    fn auto_ids_skip_caller_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(writing_executor());
        orch.initialize(temp.path()).expect("init");

        let result = orch
            .execute(ExecuteRequest {
                tasks: vec![
                    TaskRequest::new("Tidy up two").with_id("task-2"),
                    TaskRequest::new("Tidy up next"),
                ],
            })
            .expect("execute");
        let ids: Vec<&str> = result.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["task-2", "task-3"]);

        let result = orch
            .execute(ExecuteRequest {
                tasks: vec![
                    TaskRequest::new("Tidy up again"),
                    TaskRequest::new("Tidy up last").with_id("task-4"),
                ],
            })
            .expect("execute");
        let ids: Vec<&str> = result.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["task-5", "task-4"]);
    }

    #[test]
    fn save_failures_do_not_abort_the_drain() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemorySessionStore::default());
        let mut orch = Orchestrator::new(writing_executor())
            .with_config(config())
            .with_store(store.clone())
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let session = orch.initialize(temp.path()).expect("init");

        store.fail_saves(true);
        let result = orch
            .execute(ExecuteRequest::new(["Tidy up one", "Tidy up two"]))
            .expect("drain survives save failures");
        assert_eq!(result.tasks.len(), 2);
        assert_eq!(result.status, TaskStatus::Complete);
        let err = result.persistence_error.expect("stale snapshot reported");
        assert!(err.contains("unavailable"), "{err}");
        assert_eq!(orch.get_task_results().len(), 2);

        store.fail_saves(false);
        let result = orch.execute(ExecuteRequest::new(["Tidy up three"])).expect("execute");
        assert!(result.persistence_error.is_none());
        let saved = store.get(&session.session_id).expect("saved");
        assert_eq!(saved.tasks.len(), 3);
    }

    #[test]
    fn save_retried_once_the_queue_drains() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemorySessionStore::default());
        let recovering = Arc::clone(&store);
        let executor = FnExecutor::new(move |task: &ExecutorTask| {
            if task.id == "task-2" {
                recovering.fail_saves(false);
            }
            std::fs::write(task.working_dir.join(format!("{}.txt", task.id)), "x").expect("write");
            Ok(ExecutorResult::executed(task.working_dir.clone(), "done", TaskStatus::Complete))
        });
        let mut orch = Orchestrator::new(executor)
            .with_config(config())
            .with_store(store.clone())
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let session = orch.initialize(temp.path()).expect("init");

        store.fail_saves(true);
        let result = orch
            .execute(ExecuteRequest::new(["Tidy up one", "Tidy up two"]))
            .expect("execute");
        assert!(result.persistence_error.is_none());
        let saved = store.get(&session.session_id).expect("saved");
        assert_eq!(saved.tasks.len(), 2);
    }

    #[test]
    fn invalid_task_id_is_rejected_before_queueing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(ScriptedExecutor::new(Vec::new()));
        orch.initialize(temp.path()).expect("init");
        let err = orch
            .execute(ExecuteRequest {
                tasks: vec![TaskRequest::new("Tidy").with_id("../escape")],
            })
            .unwrap_err();
        assert!(err.to_string().contains("invalid task id"));
        assert!(orch.queue.is_empty());
    }

    #[test]
    fn shutdown_completes_a_fully_successful_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(writing_executor());
        orch.initialize(temp.path()).expect("init");
        orch.execute(ExecuteRequest::new(["Tidy up one"])).expect("execute");
        orch.shutdown().expect("shutdown");
        orch.shutdown().expect("idempotent");

        assert_eq!(
            orch.get_session_state().map(|s| s.status),
            Some(SessionStatus::Completed)
        );
        let err = orch.execute(ExecuteRequest::new(["Tidy"])).unwrap_err();
        assert!(matches!(err.downcast_ref::<SessionError>(), Some(SessionError::NoActiveSession)));
    }

    #[test]
    fn shutdown_after_a_failed_task_terminates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = FnExecutor::new(|task: &ExecutorTask| {
            Ok(ExecutorResult::executed(task.working_dir.clone(), "nothing", TaskStatus::Complete))
        });
        let mut orch = orchestrator(executor);
        orch.initialize(temp.path()).expect("init");
        let result = orch.execute(ExecuteRequest::new(["Tidy up one"])).expect("execute");
        assert_ne!(result.status, TaskStatus::Complete);
        orch.shutdown().expect("shutdown");

        assert_eq!(
            orch.get_session_state().map(|s| s.status),
            Some(SessionStatus::Terminated)
        );
    }

    #[test]
    fn shutdown_terminates_and_blocks_further_execution() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(ScriptedExecutor::new(Vec::new()));
        orch.initialize(temp.path()).expect("init");
        orch.shutdown().expect("shutdown");
        orch.shutdown().expect("idempotent");

        assert_eq!(
            orch.get_session_state().map(|s| s.status),
            Some(SessionStatus::Terminated)
        );
        let err = orch.execute(ExecuteRequest::new(["Tidy"])).unwrap_err();
        assert!(matches!(err.downcast_ref::<SessionError>(), Some(SessionError::NoActiveSession)));
    }
}
