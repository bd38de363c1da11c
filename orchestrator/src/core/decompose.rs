//! Decomposability analysis and subtask planning.
//!
//! A prompt is split only when several independent indicators agree. A lone
//! numbered list, or a lone mention of "independent", leaves the task whole so
//! simple requests are not fragmented.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::targets::extract_file_targets;

static NUMBERED_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)[.)]\s+(.+)$").expect("numbered line regex should be valid")
});
static BULLET_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*•]\s+(.+)$").expect("bullet line regex should be valid")
});
static INLINE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(\d+)[.)]\s+").expect("inline marker regex should be valid")
});
static INDEPENDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(independent(ly)?|separate(ly)?|in parallel|concurrently|in any order|unrelated)\b",
    )
    .expect("independence regex should be valid")
});
static SEQUENCING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(then|after that|afterwards|sequentially|in order|once (that|this) is done)\b")
        .expect("sequencing regex should be valid")
});
static LEADING_SEQUENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(then|after that|afterwards|next|finally)\b")
        .expect("leading sequence regex should be valid")
});
static DECLARED_DEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:after|following)\s+(?:step|item|task)\s*#?(\d+)\b|\bdepends on\s+(?:step\s+|item\s+|task\s+)?#?(\d+)\b")
        .expect("declared dependency regex should be valid")
});

/// Execution mode for decomposed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMode {
    Sequential,
    Parallel,
}

/// Chunking configuration (`[chunking]` in config.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// When false every task takes the atomic path.
    pub enabled: bool,
    /// Distinct indicators required before a prompt is decomposed (>= 2).
    pub min_indicators: usize,
    pub mode: ChunkingMode,
    /// Parallel mode: return ERROR on the first failed subtask.
    pub fail_fast: bool,
    /// Sequential mode: keep going after a failed subtask.
    pub continue_on_subtask_failure: bool,
    /// Parallel mode: upper bound on concurrently running subtasks.
    pub max_parallel: usize,
    pub retry: RetryPolicy,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_indicators: 2,
            mode: ChunkingMode::Sequential,
            fail_fast: true,
            continue_on_subtask_failure: false,
            max_parallel: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_indicators < 2 {
            return Err(anyhow!("chunking.min_indicators must be >= 2"));
        }
        if self.max_parallel == 0 {
            return Err(anyhow!("chunking.max_parallel must be > 0"));
        }
        self.retry.validate()
    }
}

/// Signals that a prompt contains independently executable parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    EnumeratedList,
    IndependenceLanguage,
    MultipleTargets,
}

/// One independently executable unit of a decomposed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskPlan {
    pub id: String,
    pub prompt: String,
    pub dependencies: Vec<String>,
    /// Lower runs first among ready subtasks; equals the original position.
    pub priority: u32,
}

/// Verdict of [`analyze_task_for_chunking`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingAnalysis {
    pub is_decomposable: bool,
    pub indicators: Vec<Indicator>,
    /// Subtasks in dependency order; present only when decomposable.
    pub suggested_subtasks: Option<Vec<SubtaskPlan>>,
    pub reason: String,
}

impl ChunkingAnalysis {
    fn atomic(indicators: Vec<Indicator>, reason: impl Into<String>) -> Self {
        Self {
            is_decomposable: false,
            indicators,
            suggested_subtasks: None,
            reason: reason.into(),
        }
    }
}

/// Decide whether `prompt` should be decomposed and plan its subtasks.
pub fn analyze_task_for_chunking(prompt: &str, config: &ChunkingConfig) -> ChunkingAnalysis {
    if !config.enabled {
        return ChunkingAnalysis::atomic(Vec::new(), "chunking disabled");
    }

    let list = extract_list(prompt);
    let mut indicators = Vec::new();
    if list.as_ref().is_some_and(|l| l.items.len() >= 2) {
        indicators.push(Indicator::EnumeratedList);
    }
    let independent = INDEPENDENCE_RE.is_match(prompt);
    if independent {
        indicators.push(Indicator::IndependenceLanguage);
    }
    if extract_file_targets(prompt).len() >= 2 {
        indicators.push(Indicator::MultipleTargets);
    }

    if indicators.len() < config.min_indicators {
        let reason = format!(
            "{} indicator(s) present, {} required",
            indicators.len(),
            config.min_indicators
        );
        return ChunkingAnalysis::atomic(indicators, reason);
    }
    let Some(list) = list.filter(|l| l.items.len() >= 2) else {
        return ChunkingAnalysis::atomic(indicators, "no enumerated parts to split on");
    };

    let chain = !independent && SEQUENCING_RE.is_match(prompt);
    let plans = match build_plans(&list, chain) {
        Ok(plans) => plans,
        Err(err) => return ChunkingAnalysis::atomic(indicators, err.to_string()),
    };
    let ordered = match order_subtasks(&plans) {
        Ok(ordered) => ordered,
        Err(err) => return ChunkingAnalysis::atomic(indicators, err.to_string()),
    };

    let count = ordered.len();
    ChunkingAnalysis {
        is_decomposable: true,
        indicators,
        suggested_subtasks: Some(ordered),
        reason: format!("decomposed into {count} subtasks"),
    }
}

/// Order `plans` so every subtask follows its dependencies.
///
/// Among ready subtasks the lowest priority runs first, keeping the order
/// stable. Unknown dependencies and cycles are errors.
pub fn order_subtasks(plans: &[SubtaskPlan]) -> Result<Vec<SubtaskPlan>> {
    let index: HashMap<&str, usize> = plans
        .iter()
        .enumerate()
        .map(|(i, plan)| (plan.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; plans.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plans.len()];
    for (i, plan) in plans.iter().enumerate() {
        for dep in &plan.dependencies {
            let &d = index
                .get(dep.as_str())
                .ok_or_else(|| anyhow!("subtask {} depends on unknown subtask {dep}", plan.id))?;
            if d == i {
                return Err(anyhow!("subtask {} depends on itself", plan.id));
            }
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<(u32, usize)> = plans
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, plan)| (plan.priority, i))
        .collect();
    let mut ordered = Vec::with_capacity(plans.len());
    while let Some(next) = ready.pop_first() {
        let (_, i) = next;
        ordered.push(plans[i].clone());
        for &child in &dependents[i] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.insert((plans[child].priority, child));
            }
        }
    }

    if ordered.len() != plans.len() {
        let stuck: Vec<&str> = plans
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, plan)| plan.id.as_str())
            .collect();
        return Err(anyhow!(
            "dependency cycle among subtasks: {}",
            stuck.join(", ")
        ));
    }
    Ok(ordered)
}

#[derive(Debug)]
struct ListItem {
    label: u32,
    text: String,
}

#[derive(Debug)]
struct ExtractedList {
    preamble: String,
    items: Vec<ListItem>,
}

fn extract_list(prompt: &str) -> Option<ExtractedList> {
    extract_line_list(prompt).or_else(|| extract_inline_list(prompt))
}

/// Numbered or bulleted items on their own lines. Non-item lines after the
/// first item continue the previous item.
fn extract_line_list(prompt: &str) -> Option<ExtractedList> {
    let mut preamble = Vec::new();
    let mut items: Vec<ListItem> = Vec::new();
    for line in prompt.lines() {
        if let Some(caps) = NUMBERED_LINE_RE.captures(line) {
            let label = caps[1].parse().unwrap_or(items.len() as u32 + 1);
            items.push(ListItem {
                label,
                text: caps[2].trim().to_string(),
            });
        } else if let Some(caps) = BULLET_LINE_RE.captures(line) {
            items.push(ListItem {
                label: items.len() as u32 + 1,
                text: caps[1].trim().to_string(),
            });
        } else if let Some(last) = items.last_mut() {
            if !line.trim().is_empty() {
                last.text.push(' ');
                last.text.push_str(line.trim());
            }
        } else {
            preamble.push(line);
        }
    }
    if items.len() < 2 {
        return None;
    }
    Some(ExtractedList {
        preamble: preamble.join("\n").trim().to_string(),
        items,
    })
}

/// `1. Do A 2. Do B` on a single line. Numbers must run 1, 2, 3, ...
fn extract_inline_list(prompt: &str) -> Option<ExtractedList> {
    let mut markers = Vec::new();
    let mut expected = 1u32;
    for caps in INLINE_MARKER_RE.captures_iter(prompt) {
        let Ok(n) = caps[1].parse::<u32>() else {
            continue;
        };
        if n != expected {
            continue;
        }
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        markers.push((number.start(), whole.end(), n));
        expected += 1;
    }
    if markers.len() < 2 {
        return None;
    }

    let preamble = prompt[..markers[0].0].trim().to_string();
    let items = markers
        .iter()
        .enumerate()
        .map(|(i, &(_, body_start, label))| {
            let body_end = markers.get(i + 1).map_or(prompt.len(), |next| next.0);
            ListItem {
                label,
                text: prompt[body_start..body_end].trim().to_string(),
            }
        })
        .collect();
    Some(ExtractedList { preamble, items })
}

fn build_plans(list: &ExtractedList, chain: bool) -> Result<Vec<SubtaskPlan>> {
    let label_to_id: HashMap<u32, String> = list
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.label, subtask_id(i)))
        .collect();
    let total = list.items.len();

    let mut plans = Vec::with_capacity(total);
    for (i, item) in list.items.iter().enumerate() {
        let text = strip_meta_sentences(&item.text);
        let mut dependencies: Vec<String> = Vec::new();
        for caps in DECLARED_DEP_RE.captures_iter(&text) {
            let Some(raw) = caps.get(1).or_else(|| caps.get(2)) else {
                continue;
            };
            let label: u32 = raw
                .as_str()
                .parse()
                .map_err(|_| anyhow!("invalid step reference '{}'", raw.as_str()))?;
            let id = label_to_id
                .get(&label)
                .ok_or_else(|| anyhow!("subtask {} references unknown step {label}", i + 1))?;
            if !dependencies.contains(id) {
                dependencies.push(id.clone());
            }
        }
        if i > 0 && (chain || LEADING_SEQUENCE_RE.is_match(&text)) {
            let previous = subtask_id(i - 1);
            if !dependencies.contains(&previous) {
                dependencies.push(previous);
            }
        }

        let prompt = if list.preamble.is_empty() {
            text
        } else {
            format!("{}\n\nSubtask {} of {total}: {text}", list.preamble, i + 1)
        };
        plans.push(SubtaskPlan {
            id: subtask_id(i),
            prompt,
            dependencies,
            priority: i as u32,
        });
    }
    Ok(plans)
}

fn subtask_id(index: usize) -> String {
    format!("sub-{}", index + 1)
}

/// Drop trailing sentences that only describe how the list relates
/// ("These are independent.") rather than work to do.
fn strip_meta_sentences(text: &str) -> String {
    let sentences = split_sentences(text);
    let kept: Vec<&str> = sentences
        .iter()
        .enumerate()
        .filter(|(i, sentence)| {
            *i == 0
                || !(INDEPENDENCE_RE.is_match(sentence)
                    && extract_file_targets(sentence).is_empty())
        })
        .map(|(_, sentence)| *sentence)
        .collect();
    kept.join(" ")
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?')
            && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
        {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}
