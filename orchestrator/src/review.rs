//! Review loop: repeat an executor until its result passes quality review or
//! the iteration budget runs out.
//!
//! ```text
//! START -> ITERATION(n) -> JUDGE -> PASS   -> END(COMPLETE)
//!                                -> REJECT -> n < max ? ITERATION(n+1) with feedback
//!                                                     : ESCALATE -> END(INCOMPLETE)
//!                                -> RETRY  -> n < max ? ITERATION(n+1) unchanged
//!                                                     : END(ERROR)
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::quality::{Checklist, Judgment, QualityJudgment, perform_quality_judgment};
use crate::core::types::{ExecutorResult, ExecutorTask, TaskStatus};
use crate::events::{Event, EventSink, NullSink};
use crate::io::config::ReviewConfig;
use crate::io::executor::{CancelHandle, Executor, execute_or_error};
use crate::io::prompt::{FeedbackPromptAssembler, PromptAssembler, RejectionContext};

/// Outcome of [`ReviewLoopExecutor::execute_with_review`].
///
/// `final_status` is COMPLETE exactly when one of `judgments` is PASS, and
/// `total_iterations` never exceeds the configured maximum.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewLoopResult {
    pub final_status: TaskStatus,
    pub total_iterations: u32,
    pub escalated: bool,
    pub judgments: Vec<QualityJudgment>,
    /// Result of the last iteration, with `status` set to `final_status`.
    pub last_result: ExecutorResult,
}

/// Executor wrapper that applies the quality checklist after every invocation.
pub struct ReviewLoopExecutor<E> {
    inner: E,
    config: ReviewConfig,
    checklist: Arc<Checklist>,
    assembler: Arc<dyn PromptAssembler>,
    sink: Arc<dyn EventSink>,
}

impl<E: Executor> ReviewLoopExecutor<E> {
    pub fn new(inner: E, config: ReviewConfig, checklist: Arc<Checklist>) -> Self {
        Self {
            inner,
            config,
            checklist,
            assembler: Arc::new(FeedbackPromptAssembler::new()),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn PromptAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn execute_with_review(&self, task: &ExecutorTask) -> ReviewLoopResult {
        self.review(task, &CancelHandle::new())
    }

    /// The loop itself. Once `cancel` fires, no further iteration starts.
    #[instrument(skip_all, fields(task_id = %task.id, max_iterations = self.config.max_iterations))]
    fn review(&self, task: &ExecutorTask, cancel: &CancelHandle) -> ReviewLoopResult {
        let max = self.config.max_iterations.max(1);
        let mut current = task.clone();
        let mut judgments: Vec<QualityJudgment> = Vec::new();
        let mut iteration = 0u32;

        loop {
            iteration += 1;
            self.sink.emit(&Event::IterationStart {
                task_id: task.id.clone(),
                iteration,
                max_iterations: max,
            });

            let mut result = execute_or_error(&self.inner, &current, cancel);
            if result.executor_blocked {
                self.sink.emit(&Event::ExecutorBlocked {
                    task_id: task.id.clone(),
                    blocked_reason: result.blocked_reason,
                    terminated_by: result.terminated_by,
                });
            }

            let judged = without_prompt_echo(&result, &current.prompt);
            let judgment = perform_quality_judgment(&judged, &self.checklist);
            self.sink.emit(&Event::QualityJudgment {
                task_id: task.id.clone(),
                iteration,
                judgment: judgment.judgment,
                failed: judgment.failed_criteria().map(|c| c.id.clone()).collect(),
                reason: judgment.reason.clone(),
            });
            self.sink.emit(&Event::IterationEnd {
                task_id: task.id.clone(),
                iteration,
                status: result.status,
            });
            debug!(iteration, judgment = ?judgment.judgment, reason = %judgment.reason, "iteration judged");

            let verdict = judgment.judgment;
            if verdict == Judgment::Reject {
                self.sink.emit(&Event::Reject {
                    task_id: task.id.clone(),
                    iteration,
                    reason: judgment.reason.clone(),
                });
            }

            if verdict == Judgment::Pass {
                judgments.push(judgment);
                info!(iterations = iteration, "review passed");
                result.status = TaskStatus::Complete;
                return ReviewLoopResult {
                    final_status: TaskStatus::Complete,
                    total_iterations: iteration,
                    escalated: false,
                    judgments,
                    last_result: result,
                };
            }

            if iteration >= max {
                judgments.push(judgment);
                return self.exhausted(task, verdict, iteration, judgments, result);
            }

            if cancel.is_cancelled() {
                judgments.push(judgment);
                info!(iterations = iteration, "review cancelled");
                let final_status = if result.status == TaskStatus::Error {
                    TaskStatus::Error
                } else {
                    TaskStatus::Incomplete
                };
                result.status = final_status;
                return ReviewLoopResult {
                    final_status,
                    total_iterations: iteration,
                    escalated: false,
                    judgments,
                    last_result: result,
                };
            }

            if verdict == Judgment::Reject {
                current = self.next_prompt(task, &current, iteration + 1, max, &judgment, &result);
            }
            judgments.push(judgment);
        }
    }

    fn next_prompt(
        &self,
        task: &ExecutorTask,
        current: &ExecutorTask,
        next_iteration: u32,
        max_iterations: u32,
        judgment: &QualityJudgment,
        previous: &ExecutorResult,
    ) -> ExecutorTask {
        let rejection = RejectionContext {
            original_prompt: &task.prompt,
            next_iteration,
            max_iterations,
            judgment,
            previous,
        };
        match self.assembler.assemble(&rejection) {
            Ok(prompt) => task.with_prompt(prompt),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "prompt assembly failed, reusing previous prompt");
                current.clone()
            }
        }
    }

    fn exhausted(
        &self,
        task: &ExecutorTask,
        last: Judgment,
        iterations: u32,
        judgments: Vec<QualityJudgment>,
        mut result: ExecutorResult,
    ) -> ReviewLoopResult {
        let (final_status, escalated) = match last {
            Judgment::Retry => (TaskStatus::Error, false),
            _ => (TaskStatus::Incomplete, self.config.escalate_on_max),
        };
        if escalated {
            let reason = judgments
                .last()
                .map(|j| j.reason.clone())
                .unwrap_or_default();
            self.sink.emit(&Event::Escalate {
                task_id: task.id.clone(),
                iterations,
                reason,
            });
        }
        warn!(iterations, final_status = %final_status, escalated, "review budget exhausted");
        result.status = final_status;
        if final_status == TaskStatus::Error && result.error.is_none() {
            result.error = Some(format!("executor failed on all {iterations} iterations"));
        }
        ReviewLoopResult {
            final_status,
            total_iterations: iterations,
            escalated,
            judgments,
            last_result: result,
        }
    }
}

/// Drop an echoed copy of `prompt` from the output before judging it, so an
/// agent that prints its instructions is not judged on their wording.
fn without_prompt_echo<'a>(result: &'a ExecutorResult, prompt: &str) -> Cow<'a, ExecutorResult> {
    let prompt = prompt.trim();
    if prompt.is_empty() || !result.output.contains(prompt) {
        return Cow::Borrowed(result);
    }
    let mut judged = result.clone();
    judged.output = result.output.replace(prompt, "");
    Cow::Owned(judged)
}

impl<E: Executor> Executor for ReviewLoopExecutor<E> {
    fn execute(&self, task: &ExecutorTask) -> Result<ExecutorResult> {
        Ok(self.execute_with_review(task).last_result)
    }

    fn execute_cancellable(
        &self,
        task: &ExecutorTask,
        cancel: &CancelHandle,
    ) -> Result<ExecutorResult> {
        Ok(self.review(task, cancel).last_result)
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}
