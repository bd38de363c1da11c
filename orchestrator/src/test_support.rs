//! Test-only executors, sinks and stores.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{ExecutorResult, ExecutorTask, SessionState};
use crate::events::{Event, EventSink};
use crate::io::executor::{CancelHandle, Executor};
use crate::io::session_store::SessionStore;
use crate::io::sleep::Sleeper;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executor that returns queued results in order and records every task it
/// receives. An exhausted script is an executor error.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ExecutorResult>>,
    failure: Option<String>,
    unavailable: bool,
    tasks: Mutex<Vec<ExecutorTask>>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<ExecutorResult>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    /// Every call fails with `err`.
    pub fn failing(err: anyhow::Error) -> Self {
        Self {
            failure: Some(format!("{err:#}")),
            ..Self::default()
        }
    }

    /// Reports `is_available() == false`.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn tasks(&self) -> Vec<ExecutorTask> {
        lock(&self.tasks).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.tasks).iter().map(|t| t.prompt.clone()).collect()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        lock(&self.tasks).push(task.clone());
        if let Some(message) = &self.failure {
            return Err(anyhow!("{message}"));
        }
        let mut result = lock(&self.script)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor exhausted at task {}", task.id))?;
        result.cwd = task.working_dir.clone();
        Ok(result)
    }

    fn is_available(&self) -> bool {
        !self.unavailable
    }
}

/// Executor backed by a closure; counts its calls.
pub struct FnExecutor<F> {
    run: F,
    calls: AtomicUsize,
}

impl<F> FnExecutor<F>
where
    F: Fn(&ExecutorTask) -> Result<ExecutorResult> + Send + Sync,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> Executor for FnExecutor<F>
where
    F: Fn(&ExecutorTask) -> Result<ExecutorResult> + Send + Sync,
{
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.run)(task)
    }
}

/// Executor backed by a closure that also receives the invocation's
/// [`CancelHandle`]; counts its calls.
pub struct CancellableFnExecutor<F> {
    run: F,
    calls: AtomicUsize,
}

impl<F> CancellableFnExecutor<F>
where
    F: Fn(&ExecutorTask, &CancelHandle) -> Result<ExecutorResult> + Send + Sync,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> Executor for CancellableFnExecutor<F>
where
    F: Fn(&ExecutorTask, &CancelHandle) -> Result<ExecutorResult> + Send + Sync,
{
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        self.execute_cancellable(task, &CancelHandle::new())
    }

    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.run)(task, cancel)
    }
}

/// Sleep up to `limit`, returning early (and `true`) once `cancel` fires.
pub fn sleep_unless_cancelled(cancel: &CancelHandle, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cancel.is_cancelled()
}

/// Sink that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(Event::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.events).iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &Event) {
        lock(&self.events).push(event.clone());
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        lock(&self.delays).push(duration);
    }
}

/// In-memory session store. Ids marked corrupt fail to load, and saves fail
/// while [`fail_saves`](Self::fail_saves) is on.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
    corrupt: Mutex<HashSet<String>>,
    failing: AtomicBool,
}

impl MemorySessionStore {
    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn mark_corrupt(&self, session_id: &str) {
        lock(&self.corrupt).insert(session_id.to_string());
    }

    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        lock(&self.sessions).get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, state: &SessionState) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("session store unavailable"));
        }
        lock(&self.sessions).insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        if lock(&self.corrupt).contains(session_id) {
            return Err(anyhow!("session {session_id} failed validation"));
        }
        Ok(lock(&self.sessions).get(session_id).cloned())
    }
}

/// Scratch project directory removed on drop.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        write_file(self.path(), rel, contents)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &str) -> Result<PathBuf> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    Ok(path)
}
