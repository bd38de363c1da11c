//! Quality judgment over an executor result.
//!
//! A [`Checklist`] is an ordered list of [`QualityCheck`]s. Each check is a
//! pure function of the result (output text plus verified files) and of the
//! pattern configuration it was built from. The standard list covers:
//!
//! | id | check |
//! |----|-------|
//! | Q1 | every verified file exists, at least one does, no unverified claims |
//! | Q2 | no TODO/FIXME markers in output or verified file previews |
//! | Q3 | no omission markers ("rest of the code", "..." placeholders) |
//! | Q4 | evidence-derived status is COMPLETE |
//! | Q5 | executor was not blocked |
//! | Q6 | no early-termination phrasing while nothing verifiable exists |

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{ExecutorResult, TaskStatus};

/// Outcome class of a quality judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Judgment {
    /// Content is acceptable.
    Pass,
    /// Content is wrong; retry with corrective feedback.
    Reject,
    /// Infrastructure failure; retry unchanged.
    Retry,
}

/// Result of one checklist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCriterion {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub reason: String,
}

/// Aggregate verdict over the whole checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityJudgment {
    pub judgment: Judgment,
    pub criteria_results: Vec<QualityCriterion>,
    pub reason: String,
}

impl QualityJudgment {
    pub fn failed_criteria(&self) -> impl Iterator<Item = &QualityCriterion> {
        self.criteria_results.iter().filter(|c| !c.passed)
    }
}

/// Pattern lists driving the text checks. Pure configuration data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub todo_patterns: Vec<String>,
    pub omission_patterns: Vec<String>,
    pub early_termination_patterns: Vec<String>,
    /// Also scan verified file previews for TODO markers.
    pub check_file_content: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            todo_patterns: vec![r"\b(TODO|FIXME)\b".to_string()],
            omission_patterns: vec![
                r"(?i)\.\.\.\s*(rest|remaining) of (the )?(code|file|implementation)".to_string(),
                r"(?i)//\s*\.\.\.\s*existing code".to_string(),
                r"(?i)(rest|remainder) of (the )?(code|implementation) (remains|unchanged|omitted)"
                    .to_string(),
                r"(?i)\b(implementation|code) omitted\b".to_string(),
                r"(?i)\bplaceholder implementation\b".to_string(),
            ],
            early_termination_patterns: vec![
                r"(?i)\bI(?:'ll| will) stop here\b".to_string(),
                r"(?i)\bdue to (length|time|context) (limits|limitations|constraints)\b"
                    .to_string(),
                r"(?i)\b(continue|finish) (this )?in (a|the) (next|follow-?up) (step|session|message)\b"
                    .to_string(),
                r"(?i)\bto be continued\b".to_string(),
                r"(?i)\bunable to complete\b".to_string(),
            ],
            check_file_content: true,
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<()> {
        compile_patterns("quality.todo_patterns", &self.todo_patterns)?;
        compile_patterns("quality.omission_patterns", &self.omission_patterns)?;
        compile_patterns(
            "quality.early_termination_patterns",
            &self.early_termination_patterns,
        )?;
        Ok(())
    }
}

/// Pass/fail with an explanation, produced by one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reason: String,
}

impl CheckOutcome {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// One item of the quality checklist.
pub trait QualityCheck: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome;
}

/// Ordered, extensible list of quality checks.
pub struct Checklist {
    checks: Vec<Box<dyn QualityCheck>>,
}

impl Checklist {
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    /// Standard Q1..Q6 checks compiled from `config`.
    pub fn standard(config: &QualityConfig) -> Result<Self> {
        let todo = compile_patterns("quality.todo_patterns", &config.todo_patterns)?;
        let omission = compile_patterns("quality.omission_patterns", &config.omission_patterns)?;
        let early = compile_patterns(
            "quality.early_termination_patterns",
            &config.early_termination_patterns,
        )?;

        let mut checklist = Self::empty();
        checklist.push(EvidencePresent);
        checklist.push(NoTodoMarkers {
            patterns: todo,
            check_file_content: config.check_file_content,
        });
        checklist.push(NoOmissionMarkers { patterns: omission });
        checklist.push(EvidenceStatusComplete);
        checklist.push(NotBlocked);
        checklist.push(NoEarlyTermination { patterns: early });
        Ok(checklist)
    }

    /// Append a check; it runs after every check already present.
    pub fn push<C: QualityCheck + 'static>(&mut self, check: C) {
        self.checks.push(Box::new(check));
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.checks.iter().map(|check| check.id()).collect()
    }
}

/// Judge `result` against `checklist`.
///
/// An executor-level error (status `ERROR` without a block) is an
/// infrastructure failure and yields `RETRY` regardless of the checklist.
/// Otherwise every criterion must pass for `PASS`; any failure is `REJECT`.
pub fn perform_quality_judgment(result: &ExecutorResult, checklist: &Checklist) -> QualityJudgment {
    let criteria_results: Vec<QualityCriterion> = checklist
        .checks
        .iter()
        .map(|check| {
            let outcome = check.evaluate(result);
            QualityCriterion {
                id: check.id().to_string(),
                name: check.name().to_string(),
                passed: outcome.passed,
                reason: outcome.reason,
            }
        })
        .collect();

    if result.status == TaskStatus::Error && !result.executor_blocked {
        let detail = result
            .error
            .clone()
            .unwrap_or_else(|| "executor reported ERROR".to_string());
        return QualityJudgment {
            judgment: Judgment::Retry,
            criteria_results,
            reason: format!("executor infrastructure failure: {detail}"),
        };
    }

    let failures: Vec<String> = criteria_results
        .iter()
        .filter(|c| !c.passed)
        .map(|c| format!("{} {}: {}", c.id, c.name, c.reason))
        .collect();
    if failures.is_empty() {
        return QualityJudgment {
            judgment: Judgment::Pass,
            criteria_results,
            reason: "all quality criteria passed".to_string(),
        };
    }
    QualityJudgment {
        judgment: Judgment::Reject,
        criteria_results,
        reason: failures.join("; "),
    }
}

/// Compile a configured pattern list, naming the offending key on failure.
pub fn compile_patterns(key: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("{key}: invalid pattern {pattern:?}"))
        })
        .collect()
}

fn first_match<'a>(patterns: &[Regex], text: &'a str) -> Option<&'a str> {
    patterns
        .iter()
        .find_map(|re| re.find(text).map(|m| m.as_str()))
}

struct EvidencePresent;

impl QualityCheck for EvidencePresent {
    fn id(&self) -> &str {
        "Q1"
    }

    fn name(&self) -> &str {
        "evidence_present"
    }

    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome {
        if let Some(missing) = result.verified_files.iter().find(|file| !file.exists) {
            return CheckOutcome::fail(format!("verified file missing on disk: {}", missing.path));
        }
        if !result.unverified_files.is_empty() {
            return CheckOutcome::fail(format!(
                "claimed files not found: {}",
                result.unverified_files.join(", ")
            ));
        }
        if result.verified_files.is_empty() {
            return CheckOutcome::fail("no file changes could be verified");
        }
        CheckOutcome::pass(format!(
            "{} verified file(s) exist",
            result.verified_files.len()
        ))
    }
}

struct NoTodoMarkers {
    patterns: Vec<Regex>,
    check_file_content: bool,
}

impl QualityCheck for NoTodoMarkers {
    fn id(&self) -> &str {
        "Q2"
    }

    fn name(&self) -> &str {
        "no_todo_markers"
    }

    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome {
        if let Some(marker) = first_match(&self.patterns, &result.output) {
            return CheckOutcome::fail(format!("output contains marker '{marker}'"));
        }
        if self.check_file_content {
            for file in result.existing_files() {
                let Some(preview) = file.content_preview.as_deref() else {
                    continue;
                };
                if let Some(marker) = first_match(&self.patterns, preview) {
                    return CheckOutcome::fail(format!("{} contains marker '{marker}'", file.path));
                }
            }
        }
        CheckOutcome::pass("no TODO/FIXME markers")
    }
}

struct NoOmissionMarkers {
    patterns: Vec<Regex>,
}

impl QualityCheck for NoOmissionMarkers {
    fn id(&self) -> &str {
        "Q3"
    }

    fn name(&self) -> &str {
        "no_omission_markers"
    }

    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome {
        match first_match(&self.patterns, &result.output) {
            Some(marker) => CheckOutcome::fail(format!("output elides content: '{marker}'")),
            None => CheckOutcome::pass("no omission markers"),
        }
    }
}

struct EvidenceStatusComplete;

impl QualityCheck for EvidenceStatusComplete {
    fn id(&self) -> &str {
        "Q4"
    }

    fn name(&self) -> &str {
        "evidence_status_complete"
    }

    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome {
        if result.status.is_complete() {
            CheckOutcome::pass("evidence supports completion")
        } else {
            CheckOutcome::fail(format!("evidence status is {}", result.status))
        }
    }
}

struct NotBlocked;

impl QualityCheck for NotBlocked {
    fn id(&self) -> &str {
        "Q5"
    }

    fn name(&self) -> &str {
        "not_blocked"
    }

    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome {
        if !result.executor_blocked {
            return CheckOutcome::pass("executor ran unattended");
        }
        let reason = result
            .blocked_reason
            .map(|r| format!("{r:?}"))
            .unwrap_or_else(|| "terminated".to_string());
        CheckOutcome::fail(format!(
            "executor was blocked ({reason}); run non-interactively"
        ))
    }
}

struct NoEarlyTermination {
    patterns: Vec<Regex>,
}

impl QualityCheck for NoEarlyTermination {
    fn id(&self) -> &str {
        "Q6"
    }

    fn name(&self) -> &str {
        "no_early_termination"
    }

    fn evaluate(&self, result: &ExecutorResult) -> CheckOutcome {
        let Some(phrase) = first_match(&self.patterns, &result.output) else {
            return CheckOutcome::pass("no early-termination phrasing");
        };
        if result.has_existing_evidence() {
            return CheckOutcome::pass(format!(
                "early-termination phrasing '{phrase}' but files were produced"
            ));
        }
        CheckOutcome::fail(format!(
            "executor stopped early ('{phrase}') without producing files"
        ))
    }
}
