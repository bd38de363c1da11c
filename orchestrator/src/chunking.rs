//! Task chunking: decompose a prompt into subtasks and dispatch them.
//!
//! Atomic tasks run once under the [`RetryPolicy`]. Decomposed tasks run their
//! subtasks in dependency order, either one at a time or in waves of
//! dependency-ready subtasks on worker threads. Each subtask also runs under
//! the retry policy. A wave always finishes before the task returns; on fail
//! fast the rest of the wave is cancelled and then joined.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::decompose::{ChunkingConfig, ChunkingMode, SubtaskPlan, analyze_task_for_chunking};
use crate::core::retry::RetryPolicy;
use crate::core::status::aggregate_statuses;
use crate::core::types::{ExecutorResult, ExecutorTask, TaskStatus};
use crate::events::{Event, EventSink, NullSink};
use crate::io::executor::{CancelHandle, Executor, execute_or_error};
use crate::io::sleep::{Sleeper, ThreadSleeper};

/// Executor wrapper that splits decomposable prompts into subtasks.
pub struct ChunkingExecutor<E> {
    inner: Arc<E>,
    config: ChunkingConfig,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl<E: Executor + 'static> ChunkingExecutor<E> {
    pub fn new(inner: E, config: ChunkingConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config,
            sleeper: Arc::new(ThreadSleeper),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Run `task`, decomposing it when the analysis allows.
    pub fn execute_task(&self, task: &ExecutorTask) -> ExecutorResult {
        self.run(task, &CancelHandle::new())
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    fn run(&self, task: &ExecutorTask, cancel: &CancelHandle) -> ExecutorResult {
        let analysis = analyze_task_for_chunking(&task.prompt, &self.config);
        match analysis.suggested_subtasks {
            Some(plans) if analysis.is_decomposable => self.execute_decomposed(task, plans, cancel),
            _ => {
                if analysis.indicators.len() >= self.config.min_indicators {
                    warn!(reason = %analysis.reason, "decomposition failed, running atomically");
                } else {
                    debug!(reason = %analysis.reason, "running atomically");
                }
                run_with_retry(
                    self.inner.as_ref(),
                    &self.config.retry,
                    self.sleeper.as_ref(),
                    self.sink.as_ref(),
                    &task.id,
                    task,
                    cancel,
                )
            }
        }
    }

    fn execute_decomposed(
        &self,
        task: &ExecutorTask,
        plans: Vec<SubtaskPlan>,
        cancel: &CancelHandle,
    ) -> ExecutorResult {
        info!(subtasks = plans.len(), mode = ?self.config.mode, "task decomposed");
        self.sink.emit(&Event::ChunkingStart {
            task_id: task.id.clone(),
            subtasks: plans.len(),
            mode: self.config.mode,
        });

        let result = match self.config.mode {
            ChunkingMode::Sequential => self.run_sequential(task, &plans, cancel),
            ChunkingMode::Parallel => self.run_parallel(task, &plans, cancel),
        };

        self.sink.emit(&Event::ChunkingEnd {
            task_id: task.id.clone(),
            status: result.status,
        });
        result
    }

    fn run_sequential(
        &self,
        task: &ExecutorTask,
        plans: &[SubtaskPlan],
        cancel: &CancelHandle,
    ) -> ExecutorResult {
        let mut statuses: HashMap<&str, TaskStatus> = HashMap::new();
        let mut results = Vec::with_capacity(plans.len());
        let mut aborted_by: Option<&str> = None;

        for plan in plans {
            if let Some(failed) = aborted_by {
                statuses.insert(&plan.id, TaskStatus::Incomplete);
                results.push(not_run(task, format!("{} not run: aborted after {failed} failed", plan.id)));
                continue;
            }
            if cancel.is_cancelled() {
                statuses.insert(&plan.id, TaskStatus::Incomplete);
                results.push(not_run(task, format!("{} not run: cancelled", plan.id)));
                continue;
            }
            if let Some(dep) = failed_dependency(plan, &statuses) {
                debug!(subtask = %plan.id, dependency = %dep, "dependency failed, not running");
                statuses.insert(&plan.id, TaskStatus::Incomplete);
                results.push(not_run(task, format!("{} not run: dependency {dep} did not complete", plan.id)));
                continue;
            }

            let subtask = subtask_for(task, plan);
            self.sink.emit(&Event::SubtaskStart {
                task_id: task.id.clone(),
                subtask_id: subtask.id.clone(),
            });
            let result = run_with_retry(
                self.inner.as_ref(),
                &self.config.retry,
                self.sleeper.as_ref(),
                self.sink.as_ref(),
                &task.id,
                &subtask,
                cancel,
            );
            self.sink.emit(&Event::SubtaskEnd {
                task_id: task.id.clone(),
                subtask_id: subtask.id.clone(),
                status: result.status,
            });

            statuses.insert(&plan.id, result.status);
            if !result.status.is_complete() && !self.config.continue_on_subtask_failure {
                warn!(subtask = %plan.id, status = %result.status, "subtask failed, aborting remaining subtasks");
                aborted_by = Some(plan.id.as_str());
            }
            results.push(result);
        }

        aggregate_results(task, &results)
    }

    fn run_parallel(
        &self,
        task: &ExecutorTask,
        plans: &[SubtaskPlan],
        cancel: &CancelHandle,
    ) -> ExecutorResult {
        let mut results: Vec<Option<ExecutorResult>> = vec![None; plans.len()];
        let mut statuses: HashMap<&str, TaskStatus> = HashMap::new();
        let mut pending: Vec<usize> = (0..plans.len()).collect();

        while !pending.is_empty() && !cancel.is_cancelled() {
            let mut wave = Vec::new();
            let mut waiting = Vec::new();
            for idx in pending {
                let plan = &plans[idx];
                if !plan.dependencies.iter().all(|dep| statuses.contains_key(dep.as_str())) {
                    waiting.push(idx);
                } else if let Some(dep) = failed_dependency(plan, &statuses) {
                    statuses.insert(&plan.id, TaskStatus::Incomplete);
                    results[idx] = Some(not_run(
                        task,
                        format!("{} not run: dependency {dep} did not complete", plan.id),
                    ));
                } else if wave.len() < self.config.max_parallel {
                    wave.push(idx);
                } else {
                    waiting.push(idx);
                }
            }
            pending = waiting;
            if wave.is_empty() {
                break;
            }

            debug!(wave = ?wave, "dispatching subtask wave");
            let wave_cancel = cancel.child();
            let (tx, rx) = mpsc::channel();
            for &idx in &wave {
                let subtask = subtask_for(task, &plans[idx]);
                self.sink.emit(&Event::SubtaskStart {
                    task_id: task.id.clone(),
                    subtask_id: subtask.id.clone(),
                });
                let inner = Arc::clone(&self.inner);
                let retry = self.config.retry.clone();
                let sleeper = Arc::clone(&self.sleeper);
                let sink = Arc::clone(&self.sink);
                let parent_id = task.id.clone();
                let worker_cancel = wave_cancel.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = run_with_retry(
                        inner.as_ref(),
                        &retry,
                        sleeper.as_ref(),
                        sink.as_ref(),
                        &parent_id,
                        &subtask,
                        &worker_cancel,
                    );
                    let _ = tx.send((idx, subtask.id, result));
                });
            }
            drop(tx);

            let mut failed_fast: Option<(usize, TaskStatus)> = None;
            for _ in 0..wave.len() {
                let Ok((idx, subtask_id, result)) = rx.recv() else {
                    break;
                };
                self.sink.emit(&Event::SubtaskEnd {
                    task_id: task.id.clone(),
                    subtask_id,
                    status: result.status,
                });
                let status = result.status;
                statuses.insert(&plans[idx].id, status);
                results[idx] = Some(result);

                if !status.is_complete() && self.config.fail_fast && failed_fast.is_none() {
                    warn!(subtask = %plans[idx].id, status = %status, "subtask failed, cancelling the rest of the wave");
                    wave_cancel.cancel();
                    failed_fast = Some((idx, status));
                }
            }

            if let Some((idx, status)) = failed_fast {
                let finished: Vec<ExecutorResult> = results.into_iter().flatten().collect();
                let mut aggregate = aggregate_results(task, &finished);
                aggregate.status = TaskStatus::Error;
                if aggregate.error.is_none() {
                    aggregate.error = Some(format!("subtask {} ended {status}", plans[idx].id));
                }
                return aggregate;
            }

            for &idx in &wave {
                if results[idx].is_none() {
                    statuses.insert(&plans[idx].id, TaskStatus::Error);
                    results[idx] = Some(ExecutorResult::infra_error(
                        task.working_dir.clone(),
                        format!("subtask {} worker exited without a result", plans[idx].id),
                    ));
                }
            }
        }

        let finished: Vec<ExecutorResult> = results
            .into_iter()
            .zip(plans)
            .map(|(result, plan)| {
                result.unwrap_or_else(|| not_run(task, format!("{} not run", plan.id)))
            })
            .collect();
        aggregate_results(task, &finished)
    }
}

impl<E: Executor + 'static> Executor for ChunkingExecutor<E> {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        Ok(self.execute_task(task))
    }

    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        Ok(self.run(task, cancel))
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

/// Run `task` until its status falls outside `retry.retry_on`, the attempt
/// budget is spent, or `cancel` fires. Executor errors become ERROR results.
fn run_with_retry<E: Executor + ?Sized>(
    executor: &E,
    retry: &RetryPolicy,
    sleeper: &dyn Sleeper,
    sink: &dyn EventSink,
    parent_id: &str,
    task: &ExecutorTask,
    cancel: &CancelHandle,
) -> ExecutorResult {
    let max_attempts = retry.max_attempts();
    let mut attempt = 1;
    loop {
        let result = execute_or_error(executor, task, cancel);
        if attempt >= max_attempts || !retry.should_retry(result.status) || cancel.is_cancelled() {
            return result;
        }
        let delay = retry.delay_for_retry(attempt);
        debug!(task_id = %task.id, attempt, status = %result.status, delay_ms = delay.as_millis() as u64, "retrying");
        sink.emit(&Event::SubtaskRetry {
            task_id: parent_id.to_string(),
            subtask_id: task.id.clone(),
            attempt: attempt + 1,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        sleeper.sleep(delay);
        attempt += 1;
    }
}

fn subtask_for(task: &ExecutorTask, plan: &SubtaskPlan) -> ExecutorTask {
    ExecutorTask::new(
        format!("{}-{}", task.id, plan.id),
        plan.prompt.clone(),
        task.working_dir.clone(),
    )
}

fn failed_dependency<'a>(
    plan: &'a SubtaskPlan,
    statuses: &HashMap<&str, TaskStatus>,
) -> Option<&'a str> {
    plan.dependencies
        .iter()
        .find(|dep| {
            statuses
                .get(dep.as_str())
                .is_some_and(|status| !status.is_complete())
        })
        .map(String::as_str)
}

fn not_run(task: &ExecutorTask, message: String) -> ExecutorResult {
    ExecutorResult {
        executed: false,
        ..ExecutorResult::executed(task.working_dir.clone(), message, TaskStatus::Incomplete)
    }
}

/// Fold subtask results into one result for the parent task.
///
/// Status is COMPLETE iff every part is COMPLETE, otherwise the most severe.
pub fn aggregate_results(task: &ExecutorTask, results: &[ExecutorResult]) -> ExecutorResult {
    let mut aggregate = ExecutorResult::executed(
        task.working_dir.clone(),
        String::new(),
        aggregate_statuses(results.iter().map(|r| r.status)),
    );
    aggregate.executed = results.iter().any(|r| r.executed);

    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        if !result.output.is_empty() {
            outputs.push(result.output.as_str());
        }
        for path in &result.files_modified {
            if !aggregate.files_modified.contains(path) {
                aggregate.files_modified.push(path.clone());
            }
        }
        for file in &result.verified_files {
            if !aggregate.verified_files.iter().any(|f| f.path == file.path) {
                aggregate.verified_files.push(file.clone());
            }
        }
        for path in &result.unverified_files {
            if !aggregate.unverified_files.contains(path) {
                aggregate.unverified_files.push(path.clone());
            }
        }
        if aggregate.error.is_none() {
            aggregate.error = result.error.clone();
        }
        if result.executor_blocked && !aggregate.executor_blocked {
            aggregate.executor_blocked = true;
            aggregate.blocked_reason = result.blocked_reason;
            aggregate.terminated_by = result.terminated_by;
        }
        aggregate.duration_ms = aggregate.duration_ms.saturating_add(result.duration_ms);
    }
    aggregate.output = outputs.join("\n");
    aggregate
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;
    use crate::core::types::{BlockedReason, TerminatedBy};
    use crate::test_support::{
        CancellableFnExecutor, FnExecutor, RecordingSink, RecordingSleeper, ScriptedExecutor,
        sleep_unless_cancelled,
    };

    fn task(prompt: &str) -> ExecutorTask {
        ExecutorTask::new("t1", prompt, PathBuf::from("/w"))
    }

    fn complete(output: &str) -> ExecutorResult {
        ExecutorResult::executed(PathBuf::from("/w"), output, TaskStatus::Complete)
    }

    fn error(message: &str) -> ExecutorResult {
        ExecutorResult::infra_error(PathBuf::from("/w"), message)
    }

    fn config(mode: ChunkingMode) -> ChunkingConfig {
        ChunkingConfig {
            mode,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn independent_list_runs_each_item_once() {
        let executor = ScriptedExecutor::new(vec![complete("did A"), complete("did B")]);
        let sink = Arc::new(RecordingSink::default());
        let chunking = ChunkingExecutor::new(executor, config(ChunkingMode::Sequential))
            .with_sink(sink.clone());

        let result = chunking.execute_task(&task("1. Do A 2. Do B. These are independent."));
        assert_eq!(result.status, TaskStatus::Complete);
        assert_eq!(chunking.inner().calls(), 2);
        assert_eq!(chunking.inner().prompts(), vec!["Do A", "Do B."]);
        assert_eq!(result.output, "did A\ndid B");
        assert_eq!(
            sink.names(),
            vec![
                "CHUNKING_START",
                "SUBTASK_START",
                "SUBTASK_END",
                "SUBTASK_START",
                "SUBTASK_END",
                "CHUNKING_END",
            ]
        );
        let ids: Vec<String> = chunking.inner().tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t1-sub-1", "t1-sub-2"]);
    }

    #[test]
    fn atomic_retry_backs_off_geometrically() {
        let executor = ScriptedExecutor::new(vec![error("boom"), error("boom"), complete("ok")]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let sink = Arc::new(RecordingSink::default());
        let chunking = ChunkingExecutor::new(
            executor,
            ChunkingConfig {
                retry: RetryPolicy {
                    max_retries: 3,
                    retry_delay_ms: 100,
                    backoff_multiplier: 3.0,
                    retry_on: vec![TaskStatus::Error],
                },
                ..ChunkingConfig::default()
            },
        )
        .with_sleeper(sleeper.clone())
        .with_sink(sink.clone());

        let result = chunking.execute_task(&task("Fix the parser"));
        assert_eq!(result.status, TaskStatus::Complete);
        assert_eq!(chunking.inner().calls(), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(300)]
        );
        assert_eq!(sink.count("SUBTASK_RETRY"), 2);
    }

    #[test]
    fn atomic_retry_never_exceeds_max_attempts() {
        let executor = ScriptedExecutor::failing(anyhow!("executor offline"));
        let sleeper = Arc::new(RecordingSleeper::default());
        let chunking = ChunkingExecutor::new(executor, ChunkingConfig::default())
            .with_sleeper(sleeper.clone());

        let result = chunking.execute_task(&task("Fix the parser"));
        assert_eq!(result.status, TaskStatus::Error);
        assert!(!result.executed);
        assert_eq!(chunking.inner().calls(), 3);
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[test]
    fn statuses_outside_retry_on_are_not_retried() {
        let executor = ScriptedExecutor::new(vec![ExecutorResult::executed(
            PathBuf::from("/w"),
            "nothing",
            TaskStatus::NoEvidence,
        )]);
        let chunking = ChunkingExecutor::new(executor, ChunkingConfig::default())
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let result = chunking.execute_task(&task("Fix the parser"));
        assert_eq!(result.status, TaskStatus::NoEvidence);
        assert_eq!(chunking.inner().calls(), 1);
    }

    #[test]
    fn sequential_failure_aborts_remaining_subtasks() {
        let executor = ScriptedExecutor::new(vec![
            complete("A"),
            ExecutorResult::executed(PathBuf::from("/w"), "B", TaskStatus::Incomplete),
            complete("C"),
        ]);
        let chunking = ChunkingExecutor::new(executor, config(ChunkingMode::Sequential));

        let result = chunking.execute_task(&task(
            "1. Update a.rs\n2. Update b.rs\n3. Update c.rs\nEach can be done independently.",
        ));
        assert_eq!(result.status, TaskStatus::Incomplete);
        assert_eq!(chunking.inner().calls(), 2);
        assert!(result.output.contains("aborted after sub-2 failed"));
    }

    #[test]
    fn continue_on_failure_runs_everything_but_skips_dependents() {
        let executor = ScriptedExecutor::new(vec![
            ExecutorResult::executed(PathBuf::from("/w"), "A", TaskStatus::NoEvidence),
            complete("C"),
        ]);
        let chunking = ChunkingExecutor::new(
            executor,
            ChunkingConfig {
                continue_on_subtask_failure: true,
                ..ChunkingConfig::default()
            },
        );

        let result = chunking.execute_task(&task(
            "1. Update a.rs\n2. Update b.rs after step 1\n3. Update c.rs\nThese are independent.",
        ));
        let prompts = chunking.inner().prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0], "Update a.rs");
        assert!(prompts[1].starts_with("Update c.rs"));
        assert_eq!(result.status, TaskStatus::Incomplete);
        assert!(result.output.contains("dependency sub-1 did not complete"));
    }

    #[test]
    fn parallel_respects_max_parallel_and_keeps_order() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_seen, peak_seen) = (Arc::clone(&running), Arc::clone(&peak));
        let executor = FnExecutor::new(move |task: &ExecutorTask| {
            let now = running_seen.fetch_add(1, Ordering::SeqCst) + 1;
            peak_seen.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            running_seen.fetch_sub(1, Ordering::SeqCst);
            Ok(complete(&task.id))
        });
        let chunking = ChunkingExecutor::new(
            executor,
            ChunkingConfig {
                mode: ChunkingMode::Parallel,
                max_parallel: 2,
                ..ChunkingConfig::default()
            },
        );

        let result = chunking.execute_task(&task(
            "1. Write a.rs\n2. Write b.rs\n3. Write c.rs\n4. Write d.rs\nDo these in parallel.",
        ));
        assert_eq!(result.status, TaskStatus::Complete);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(result.output, "t1-sub-1\nt1-sub-2\nt1-sub-3\nt1-sub-4");
    }

    #[test]
    fn parallel_fail_fast_returns_error() {
        let executor = FnExecutor::new(|task: &ExecutorTask| {
            if task.prompt.contains("b.rs") {
                Ok(ExecutorResult::executed(PathBuf::from("/w"), "no", TaskStatus::NoEvidence))
            } else {
                Ok(complete(&task.prompt))
            }
        });
        let chunking = ChunkingExecutor::new(
            executor,
            ChunkingConfig {
                mode: ChunkingMode::Parallel,
                fail_fast: true,
                ..ChunkingConfig::default()
            },
        );

        let result = chunking.execute_task(&task(
            "1. Write a.rs\n2. Write b.rs\nThey are independent.",
        ));
        assert_eq!(result.status, TaskStatus::Error);
        assert!(result.error.is_some());
    }

    #[test]
    fn fail_fast_cancels_and_joins_the_rest_of_the_wave() {
        let running = Arc::new(AtomicUsize::new(0));
        let sibling_cancelled = Arc::new(AtomicUsize::new(0));
        let (live, seen) = (Arc::clone(&running), Arc::clone(&sibling_cancelled));
        let executor = CancellableFnExecutor::new(move |task: &ExecutorTask, cancel: &CancelHandle| {
            live.fetch_add(1, Ordering::SeqCst);
            let result = if task.prompt.contains("a.rs") {
                ExecutorResult::executed(PathBuf::from("/w"), "no", TaskStatus::NoEvidence)
            } else {
                if sleep_unless_cancelled(cancel, Duration::from_secs(5)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                ExecutorResult::executed(PathBuf::from("/w"), "stopped", TaskStatus::Incomplete)
            };
            live.fetch_sub(1, Ordering::SeqCst);
            Ok(result)
        });
        let chunking = ChunkingExecutor::new(
            executor,
            ChunkingConfig {
                mode: ChunkingMode::Parallel,
                fail_fast: true,
                ..ChunkingConfig::default()
            },
        );

        let started = std::time::Instant::now();
        let result = chunking.execute_task(&task(
            "1. Write a.rs\n2. Write b.rs\nThey are independent.",
        ));

        assert_eq!(result.status, TaskStatus::Error);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(sibling_cancelled.load(Ordering::SeqCst), 1);
        assert!(result.output.contains("stopped"));
    }

    #[test]
    fn cancelled_parent_dispatches_nothing() {
        let executor = FnExecutor::new(|task: &ExecutorTask| Ok(complete(&task.prompt)));
        let chunking = ChunkingExecutor::new(executor, config(ChunkingMode::Parallel));
        let cancel = CancelHandle::new();
        cancel.cancel();

        let result = chunking
            .execute_cancellable(
                &task("1. Write a.rs\n2. Write b.rs\nThey are independent."),
                &cancel,
            )
            .expect("chunked");
        assert_ne!(result.status, TaskStatus::Complete);
        assert_eq!(chunking.inner().calls(), 0);
    }

    #[test]
    fn parallel_without_fail_fast_aggregates_by_precedence() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let executor = FnExecutor::new(move |task: &ExecutorTask| {
            record.lock().expect("lock").push(task.id.clone());
            if task.prompt.contains("a.rs") {
                Ok(ExecutorResult::executed(PathBuf::from("/w"), "none", TaskStatus::NoEvidence))
            } else {
                Ok(complete(&task.prompt))
            }
        });
        let chunking = ChunkingExecutor::new(
            executor,
            ChunkingConfig {
                mode: ChunkingMode::Parallel,
                fail_fast: false,
                ..ChunkingConfig::default()
            },
        );

        let result = chunking.execute_task(&task(
            "1. Write a.rs\n2. Write b.rs\n3. Write c.rs after step 1\nThey are independent.",
        ));
        assert_eq!(result.status, TaskStatus::Incomplete);
        let mut ids = seen.lock().expect("lock").clone();
        ids.sort();
        assert_eq!(ids, vec!["t1-sub-1", "t1-sub-2"]);
    }

    #[test]
    fn aggregation_keeps_first_error_and_blocking_metadata() {
        let blocked = ExecutorResult::blocked(
            PathBuf::from("/w"),
            "stuck",
            Some(BlockedReason::Timeout),
            TerminatedBy::Timeout,
        );
        let mut first = complete("one");
        first.files_modified = vec!["a.rs".to_string(), "b.rs".to_string()];
        let mut third = error("late failure");
        third.files_modified = vec!["b.rs".to_string(), "c.rs".to_string()];
        third.duration_ms = 5;

        let aggregate = aggregate_results(&task("x"), &[first, blocked, third]);
        assert_eq!(aggregate.status, TaskStatus::Error);
        assert_eq!(aggregate.files_modified, vec!["a.rs", "b.rs", "c.rs"]);
        assert_eq!(aggregate.error.as_deref(), Some("late failure"));
        assert!(aggregate.executor_blocked);
        assert_eq!(aggregate.terminated_by, Some(TerminatedBy::Timeout));
        assert_eq!(aggregate.duration_ms, 5);
    }

    #[test]
    fn empty_aggregation_is_never_complete() {
        assert_eq!(aggregate_results(&task("x"), &[]).status, TaskStatus::NoEvidence);
    }
}
