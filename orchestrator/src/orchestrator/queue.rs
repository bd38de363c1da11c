//! FIFO task queue shared between the orchestrator and submit handles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// One task as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-chosen id; generated as `task-N` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub prompt: String,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    items: Arc<Mutex<VecDeque<TaskRequest>>>,
}

impl TaskQueue {
    fn items(&self) -> MutexGuard<'_, VecDeque<TaskRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, request: TaskRequest) {
        self.items().push_back(request);
    }

    pub(crate) fn pop(&self) -> Option<TaskRequest> {
        self.items().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub(crate) fn handle(&self) -> TaskQueueHandle {
        TaskQueueHandle {
            items: Arc::clone(&self.items),
        }
    }
}

/// Cloneable producer side of the orchestrator's queue.
///
/// Tasks submitted while [`Orchestrator::execute`](super::Orchestrator::execute)
/// is draining run in the same call, after everything queued before them.
#[derive(Debug, Clone)]
pub struct TaskQueueHandle {
    items: Arc<Mutex<VecDeque<TaskRequest>>>,
}

impl TaskQueueHandle {
    pub fn submit(&self, request: TaskRequest) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request);
    }
}
