//! Task state machine

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Context is being spawned
    Launching,

    /// Context acknowledged startup and is running the body
    Running,

    /// Result received and decoded
    Completed,

    /// Task failed; the completion carries the error
    Failed,
}

impl TaskState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskState::Launching => "Launching",
            TaskState::Running => "Running",
            TaskState::Completed => "Completed",
            TaskState::Failed => "Failed",
        }
    }

    fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Launching, TaskState::Running)
                | (TaskState::Launching, TaskState::Failed)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Shared, observable task state.
#[derive(Debug, Clone)]
pub struct TaskStateCell(Arc<Mutex<TaskState>>);

impl TaskStateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TaskState::Launching)))
    }

    pub fn get(&self) -> TaskState {
        *self.0.lock()
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub(crate) fn transition(&self, next: TaskState) -> bool {
        let mut state = self.0.lock();
        if !state.can_transition_to(next) {
            let current = *state;
            warn!(from = %current, to = %next, "ignored illegal task state transition");
            return false;
        }
        *state = next;
        true
    }
}

impl Default for TaskStateCell {
    fn default() -> Self {
        Self::new()
    }
}
