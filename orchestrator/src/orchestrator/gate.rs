//! Lock, slot and evidence gate around every raw executor invocation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::targets::extract_file_targets;
use crate::core::types::{BlockedReason, ExecutorResult, ExecutorTask, TerminatedBy};
use crate::io::config::{EvidenceConfig, LockConfig};
use crate::io::evidence::{apply_evidence, diff, snapshot};
use crate::io::executor::{CancelHandle, Executor};
use crate::locks::{LockError, LockGuard, LockManager, LockType, SlotGuard};

/// How long a timed-out invocation gets to wind down after cancellation
/// before the gate stops waiting for it.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Resources an invocation of `task` locks: WRITE on each named file target
/// (sorted), else WRITE on the whole working directory.
pub fn lock_plan(task: &ExecutorTask) -> Vec<(PathBuf, LockType)> {
    let mut targets = extract_file_targets(&task.prompt);
    targets.sort();
    targets.dedup();
    if targets.is_empty() {
        return vec![(task.working_dir.clone(), LockType::Write)];
    }
    targets
        .into_iter()
        .map(|target| (task.working_dir.join(target), LockType::Write))
        .collect()
}

/// Keep the changed paths that fall under a resource in `plan`.
///
/// Anything else changed while the invocation ran belongs to some other
/// lock holder and is not this invocation's evidence.
fn scoped_changes(
    changed: Vec<String>,
    task: &ExecutorTask,
    plan: &[(PathBuf, LockType)],
) -> Vec<String> {
    changed
        .into_iter()
        .filter(|path| {
            let full = task.working_dir.join(path);
            let inside = plan.iter().any(|(resource, _)| full.starts_with(resource));
            if !inside {
                debug!(path = %path, "change outside locked resources ignored");
            }
            inside
        })
        .collect()
}

/// Locks and slot held for one invocation, released together on drop.
struct Held {
    _locks: Vec<LockGuard>,
    _slot: SlotGuard,
}

/// Wraps an executor so each invocation holds its resource locks and an
/// executor slot, runs under a hard timeout, and has its claims replaced by
/// filesystem evidence.
///
/// The locks and slot travel with the worker thread: an invocation abandoned
/// at the hard timeout keeps them until it actually returns.
pub struct GatedExecutor<E> {
    inner: Arc<E>,
    locks: Arc<LockManager>,
    lock_config: LockConfig,
    evidence: EvidenceConfig,
    hard_timeout: Duration,
    cancel_grace: Duration,
}

impl<E: Executor + 'static> GatedExecutor<E> {
    pub fn new(
        inner: Arc<E>,
        locks: Arc<LockManager>,
        lock_config: LockConfig,
        evidence: EvidenceConfig,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            locks,
            lock_config,
            evidence,
            hard_timeout,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    fn poll<T>(&self, mut attempt: impl FnMut() -> Result<T, LockError>) -> Result<T, LockError> {
        let deadline = Instant::now() + Duration::from_millis(self.lock_config.acquire_timeout_ms);
        let poll = Duration::from_millis(self.lock_config.acquire_poll_ms);
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if Instant::now() >= deadline => return Err(err),
                Err(err) => {
                    debug!(err = %err, "waiting for lock");
                    thread::sleep(poll);
                }
            }
        }
    }

    fn acquire(&self, task: &ExecutorTask, plan: &[(PathBuf, LockType)]) -> Result<Held> {
        let mut locks = Vec::with_capacity(plan.len());
        for (path, lock_type) in plan {
            locks.push(self.poll(|| self.locks.lock_scoped(path, &task.id, *lock_type))?);
        }
        let slot = self.poll(|| self.locks.slot_scoped(&task.id))?;
        debug!(locks = locks.len(), "gate acquired");
        Ok(Held {
            _locks: locks,
            _slot: slot,
        })
    }

    /// Run the inner executor on a worker thread that owns `held`.
    ///
    /// Returns the resources alongside the result when the worker finished in
    /// time; otherwise they stay with the worker and drop when it exits.
    fn run_bounded(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
        held: Held,
    ) -> Result<(ExecutorResult, Option<Held>)> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let owned = task.clone();
        let invocation = cancel.child();
        let worker_cancel = invocation.clone();
        thread::Builder::new()
            .name(format!("executor-{}", task.id))
            .spawn(move || {
                let result = inner.execute_cancellable(&owned, &worker_cancel);
                if let Err(mpsc::SendError((_, held))) = tx.send((result, held)) {
                    debug!(task_id = %owned.id, "abandoned invocation finished, releasing its locks");
                    drop(held);
                }
            })
            .context("spawn executor thread")?;

        match rx.recv_timeout(self.hard_timeout) {
            Ok((result, held)) => Ok((result?, Some(held))),
            Err(RecvTimeoutError::Timeout) => {
                invocation.cancel();
                warn!(
                    task_id = %task.id,
                    timeout_ms = self.hard_timeout.as_millis() as u64,
                    "hard timeout, cancelling invocation"
                );
                let held = match rx.recv_timeout(self.cancel_grace) {
                    Ok((_, held)) => Some(held),
                    Err(_) => {
                        warn!(task_id = %task.id, "invocation ignored cancellation, it keeps its locks until it returns");
                        None
                    }
                };
                let result = ExecutorResult::blocked(
                    task.working_dir.clone(),
                    format!("executor exceeded hard timeout of {:?}", self.hard_timeout),
                    Some(BlockedReason::Timeout),
                    TerminatedBy::Timeout,
                );
                Ok((result, held))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("executor thread for {} exited without a result", task.id))
            }
        }
    }
}

impl<E: Executor + 'static> Executor for GatedExecutor<E> {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        self.execute_cancellable(task, &CancelHandle::new())
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        if cancel.is_cancelled() {
            debug!("cancelled before start");
            return Ok(ExecutorResult::blocked(
                task.working_dir.clone(),
                "cancelled before the executor started",
                None,
                TerminatedBy::User,
            ));
        }
        let started = Instant::now();
        let plan = lock_plan(task);
        let held = self.acquire(task, &plan)?;

        let before = snapshot(&task.working_dir, &self.evidence)?;
        let (mut result, held) = self.run_bounded(task, cancel, held)?;
        let after = snapshot(&task.working_dir, &self.evidence)?;
        let changed = scoped_changes(diff(&before, &after), task, &plan);
        debug!(changed = changed.len(), "filesystem diff");

        if result.duration_ms == 0 {
            result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
        result.cwd = task.working_dir.clone();
        let result = apply_evidence(result, &changed, &task.working_dir, &self.evidence);
        drop(held);
        Ok(result)
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}
