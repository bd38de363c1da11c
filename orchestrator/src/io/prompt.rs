//! Prompt assembly for review-loop retries.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::quality::QualityJudgment;
use crate::core::types::ExecutorResult;

const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");

/// Characters of the previous output quoted back to the executor.
const OUTPUT_EXCERPT_CHARS: usize = 2_000;

/// Everything known about a rejected iteration.
#[derive(Debug, Clone, Copy)]
pub struct RejectionContext<'a> {
    pub original_prompt: &'a str,
    /// Iteration about to run (1-indexed).
    pub next_iteration: u32,
    pub max_iterations: u32,
    pub judgment: &'a QualityJudgment,
    pub previous: &'a ExecutorResult,
}

/// Builds the next iteration's prompt after a REJECT.
pub trait PromptAssembler: Send + Sync {
    fn assemble(&self, rejection: &RejectionContext<'_>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct FailedCriterion<'a> {
    id: &'a str,
    name: &'a str,
    reason: &'a str,
}

/// Default assembler: the original prompt followed by the failed checks,
/// rendered with minijinja.
pub struct FeedbackPromptAssembler {
    env: Environment<'static>,
}

impl FeedbackPromptAssembler {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template("retry", RETRY_TEMPLATE)
            .expect("retry template should be valid");
        Self { env }
    }
}

impl Default for FeedbackPromptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptAssembler for FeedbackPromptAssembler {
    fn assemble(&self, rejection: &RejectionContext<'_>) -> Result<String> {
        let failed: Vec<FailedCriterion<'_>> = rejection
            .judgment
            .failed_criteria()
            .map(|c| FailedCriterion {
                id: &c.id,
                name: &c.name,
                reason: &c.reason,
            })
            .collect();
        let excerpt = tail_chars(rejection.previous.output.trim(), OUTPUT_EXCERPT_CHARS);

        let template = self.env.get_template("retry")?;
        let rendered = template.render(context! {
            original_prompt => rejection.original_prompt.trim(),
            iteration => rejection.next_iteration,
            max_iterations => rejection.max_iterations,
            failed => failed,
            unverified => &rejection.previous.unverified_files,
            previous_output => (!excerpt.is_empty()).then_some(excerpt),
        })?;
        debug!(
            iteration = rejection.next_iteration,
            bytes = rendered.len(),
            "assembled retry prompt"
        );
        Ok(rendered)
    }
}

/// Last `max` characters of `text`.
fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::quality::{Judgment, QualityCriterion};
    use crate::core::types::TaskStatus;

    fn rejected() -> QualityJudgment {
        QualityJudgment {
            judgment: Judgment::Reject,
            criteria_results: vec![
                QualityCriterion {
                    id: "Q1".to_string(),
                    name: "evidence_present".to_string(),
                    passed: false,
                    reason: "claimed file missing: ghost.ts".to_string(),
                },
                QualityCriterion {
                    id: "Q2".to_string(),
                    name: "no_todo_markers".to_string(),
                    passed: true,
                    reason: "no markers".to_string(),
                },
            ],
            reason: "Q1 failed".to_string(),
        }
    }

    #[test]
    fn retry_prompt_lists_failed_checks_only() {
        let mut previous =
            ExecutorResult::executed(PathBuf::from("/w"), "I wrote ghost.ts", TaskStatus::Incomplete);
        previous.unverified_files = vec!["ghost.ts".to_string()];
        let judgment = rejected();
        let prompt = FeedbackPromptAssembler::new()
            .assemble(&RejectionContext {
                original_prompt: "Create ghost.ts",
                next_iteration: 2,
                max_iterations: 3,
                judgment: &judgment,
                previous: &previous,
            })
            .expect("assemble");

        assert!(prompt.starts_with("Create ghost.ts"));
        assert!(prompt.contains("attempt 2 of 3"));
        assert!(prompt.contains("Q1 evidence_present: claimed file missing: ghost.ts"));
        assert!(!prompt.contains("no_todo_markers"));
        assert!(prompt.contains("- ghost.ts"));
        assert!(prompt.contains("I wrote ghost.ts"));
    }

    #[test]
    fn retry_wording_does_not_trip_the_checklist() {
        use crate::core::quality::{Checklist, QualityConfig, perform_quality_judgment};
        use crate::core::types::VerifiedFile;

        let previous = ExecutorResult::executed(PathBuf::from("/w"), "", TaskStatus::Incomplete);
        let judgment = rejected();
        let prompt = FeedbackPromptAssembler::new()
            .assemble(&RejectionContext {
                original_prompt: "Create ghost.ts",
                next_iteration: 2,
                max_iterations: 3,
                judgment: &judgment,
                previous: &previous,
            })
            .expect("assemble");

        let mut echoed = ExecutorResult::executed(PathBuf::from("/w"), prompt, TaskStatus::Complete);
        echoed.files_modified = vec!["ghost.ts".to_string()];
        echoed.verified_files = vec![VerifiedFile {
            path: "ghost.ts".to_string(),
            exists: true,
            size: Some(9),
            content_preview: Some("export {}".to_string()),
        }];
        let checklist = Checklist::standard(&QualityConfig::default()).expect("checklist");
        let judged = perform_quality_judgment(&echoed, &checklist);
        assert_eq!(judged.judgment, Judgment::Pass, "{}", judged.reason);
    }

    #[test]
    fn tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("ab", 5), "ab");
    }
}
