//! Structured pipeline events.
//!
//! Events are observational only: nothing in the pipeline branches on whether
//! a sink or subscriber received them. The [`EventHub`] fans events out to
//! `tracing`, to subscribers registered with [`EventHub::on`], and to the
//! per-task recorder that feeds task logs.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ambiguity::ClarificationReason;
use crate::core::decompose::ChunkingMode;
use crate::core::quality::Judgment;
use crate::core::types::{BlockedReason, TaskStatus, TerminatedBy};

/// Subscribe to every event with this name.
pub const ALL_EVENTS: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    SessionStart {
        session_id: String,
    },
    SessionEnd {
        session_id: String,
        aggregate_status: Option<TaskStatus>,
    },
    TaskStart {
        task_id: String,
    },
    TaskEnd {
        task_id: String,
        status: TaskStatus,
        skipped: bool,
    },
    ClarificationNeeded {
        task_id: String,
        reason: ClarificationReason,
        detail: String,
    },
    IterationStart {
        task_id: String,
        iteration: u32,
        max_iterations: u32,
    },
    IterationEnd {
        task_id: String,
        iteration: u32,
        status: TaskStatus,
    },
    QualityJudgment {
        task_id: String,
        iteration: u32,
        judgment: Judgment,
        failed: Vec<String>,
        reason: String,
    },
    Reject {
        task_id: String,
        iteration: u32,
        reason: String,
    },
    Escalate {
        task_id: String,
        iterations: u32,
        reason: String,
    },
    ChunkingStart {
        task_id: String,
        subtasks: usize,
        mode: ChunkingMode,
    },
    SubtaskStart {
        task_id: String,
        subtask_id: String,
    },
    SubtaskEnd {
        task_id: String,
        subtask_id: String,
        status: TaskStatus,
    },
    SubtaskRetry {
        task_id: String,
        subtask_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    ChunkingEnd {
        task_id: String,
        status: TaskStatus,
    },
    ExecutorBlocked {
        task_id: String,
        blocked_reason: Option<BlockedReason>,
        terminated_by: Option<TerminatedBy>,
    },
}

impl Event {
    /// Wire name, as written in task logs and used by [`EventHub::on`].
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionStart { .. } => "SESSION_START",
            Event::SessionEnd { .. } => "SESSION_END",
            Event::TaskStart { .. } => "TASK_START",
            Event::TaskEnd { .. } => "TASK_END",
            Event::ClarificationNeeded { .. } => "CLARIFICATION_NEEDED",
            Event::IterationStart { .. } => "ITERATION_START",
            Event::IterationEnd { .. } => "ITERATION_END",
            Event::QualityJudgment { .. } => "QUALITY_JUDGMENT",
            Event::Reject { .. } => "REJECT",
            Event::Escalate { .. } => "ESCALATE",
            Event::ChunkingStart { .. } => "CHUNKING_START",
            Event::SubtaskStart { .. } => "SUBTASK_START",
            Event::SubtaskEnd { .. } => "SUBTASK_END",
            Event::SubtaskRetry { .. } => "SUBTASK_RETRY",
            Event::ChunkingEnd { .. } => "CHUNKING_END",
            Event::ExecutorBlocked { .. } => "EXECUTOR_BLOCKED",
        }
    }

    /// Task (or subtask) the event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::SessionStart { .. } | Event::SessionEnd { .. } => None,
            Event::TaskStart { task_id }
            | Event::TaskEnd { task_id, .. }
            | Event::ClarificationNeeded { task_id, .. }
            | Event::IterationStart { task_id, .. }
            | Event::IterationEnd { task_id, .. }
            | Event::QualityJudgment { task_id, .. }
            | Event::Reject { task_id, .. }
            | Event::Escalate { task_id, .. }
            | Event::ChunkingStart { task_id, .. }
            | Event::SubtaskStart { task_id, .. }
            | Event::SubtaskEnd { task_id, .. }
            | Event::SubtaskRetry { task_id, .. }
            | Event::ChunkingEnd { task_id, .. }
            | Event::ExecutorBlocked { task_id, .. } => Some(task_id.as_str()),
        }
    }
}

/// An event with the time it was emitted; the task-log entry format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// Receiver of pipeline events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: &Event) {
        (**self).emit(event);
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-out sink with named subscriptions and a per-task recorder.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<(String, Callback)>>,
    recording: Mutex<Option<Vec<TimedEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` for every event named `name` (or every event for
    /// [`ALL_EVENTS`]).
    pub fn on<F>(&self, name: &str, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), Arc::new(callback)));
    }

    /// Start collecting events, discarding anything collected before.
    pub fn start_recording(&self) {
        *self.recording.lock().unwrap_or_else(PoisonError::into_inner) = Some(Vec::new());
    }

    /// Stop collecting and return what was collected.
    pub fn take_recording(&self) -> Vec<TimedEvent> {
        self.recording
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }
}

impl EventSink for EventHub {
    fn emit(&self, event: &Event) {
        debug!(event = event.name(), task_id = event.task_id().unwrap_or("-"), "event");

        if let Some(recorded) = self
            .recording
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            recorded.push(TimedEvent {
                timestamp: Utc::now(),
                event: event.clone(),
            });
        }

        // Callbacks run outside the lock so they may subscribe or emit.
        let matching: Vec<Callback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(name, _)| name == ALL_EVENTS || name == event.name())
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in matching {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn task_start(id: &str) -> Event {
        Event::TaskStart {
            task_id: id.to_string(),
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = Event::SubtaskEnd {
            task_id: "t1".to_string(),
            subtask_id: "t1-sub-1".to_string(),
            status: TaskStatus::Complete,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "SUBTASK_END");
        assert_eq!(value["status"], "COMPLETE");
        assert_eq!(event.name(), "SUBTASK_END");
    }

    #[test]
    fn timed_event_flattens_fields() {
        let timed = TimedEvent {
            timestamp: Utc::now(),
            event: task_start("t1"),
        };
        let value = serde_json::to_value(&timed).expect("serialize");
        assert_eq!(value["type"], "TASK_START");
        assert_eq!(value["task_id"], "t1");
        assert!(value["timestamp"].is_string());
        let back: TimedEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, timed);
    }

    #[test]
    fn subscribers_filter_by_name() {
        let hub = EventHub::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let starts_seen = Arc::clone(&starts);
        hub.on("TASK_START", move |_| {
            starts_seen.fetch_add(1, Ordering::SeqCst);
        });
        let all_seen = Arc::clone(&all);
        hub.on(ALL_EVENTS, move |_| {
            all_seen.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&task_start("t1"));
        hub.emit(&Event::ChunkingEnd {
            task_id: "t1".to_string(),
            status: TaskStatus::Complete,
        });

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn recorder_only_keeps_events_while_recording() {
        let hub = EventHub::new();
        hub.emit(&task_start("before"));
        hub.start_recording();
        hub.emit(&task_start("during"));
        let recorded = hub.take_recording();
        hub.emit(&task_start("after"));

        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].event.task_id(), Some("during"));
        assert!(hub.take_recording().is_empty());
    }
}
