//! Fail-closed ambiguity gate applied before a task reaches the executor.
//!
//! The gate does not try to understand the request. It only refuses prompts
//! whose target cannot be resolved: nothing to do, a creation request with
//! no file named, or a creation request for a file that already exists.
//! Only the object of the creation verb is checked for existence; other
//! files the prompt mentions are references.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::targets::extract_file_targets;

static CREATION_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(create|generate|scaffold|bootstrap|new\s+file|(write|add|make)\s+(a\s+|an\s+)?new)\b",
    )
    .expect("creation verb regex should be valid")
});

/// Structured reason a task was held back for clarification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClarificationReason {
    /// Prompt is empty or whitespace.
    EmptyPrompt,
    /// The prompt asks for something to be created but names no file.
    MissingTarget,
    /// The prompt asks for a file to be created that already exists.
    TargetExists,
}

impl ClarificationReason {
    pub fn message(self) -> &'static str {
        match self {
            ClarificationReason::EmptyPrompt => "task prompt is empty",
            ClarificationReason::MissingTarget => "creation requested but no target file named",
            ClarificationReason::TargetExists => "creation requested for a file that already exists",
        }
    }
}

/// Gate verdict for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Target resolved; `targets` lists the file targets named by the prompt.
    Proceed { targets: Vec<String> },
    /// Must not reach the executor.
    Clarify {
        reason: ClarificationReason,
        detail: String,
    },
}

/// Evaluate `prompt` against the ambiguity rules.
///
/// `exists` answers whether a target path (relative to the working directory)
/// is already present, keeping this function free of filesystem access.
pub fn evaluate_prompt<F: Fn(&str) -> bool>(prompt: &str, exists: F) -> GateDecision {
    if prompt.trim().is_empty() {
        return GateDecision::Clarify {
            reason: ClarificationReason::EmptyPrompt,
            detail: ClarificationReason::EmptyPrompt.message().to_string(),
        };
    }

    let targets = extract_file_targets(prompt);
    if let Some(verb) = CREATION_VERB_RE.find(prompt) {
        let created = extract_file_targets(&prompt[verb.end()..])
            .into_iter()
            .next()
            .or_else(|| targets.first().cloned());
        let Some(created) = created else {
            return GateDecision::Clarify {
                reason: ClarificationReason::MissingTarget,
                detail: ClarificationReason::MissingTarget.message().to_string(),
            };
        };
        if exists(&created) {
            return GateDecision::Clarify {
                reason: ClarificationReason::TargetExists,
                detail: format!("{}: {created}", ClarificationReason::TargetExists.message()),
            };
        }
    }

    GateDecision::Proceed { targets }
}
