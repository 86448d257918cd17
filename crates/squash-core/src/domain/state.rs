//! Task state machine.

use serde::{Deserialize, Serialize};

/// State of one compression task.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Failed
///
/// Completed and Failed are terminal; nothing leaves them except clear-all,
/// which removes the task altogether.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, waiting for its worker to start.
    Pending,

    /// Worker running.
    Processing,

    /// Output written, outcome recorded.
    Completed,

    /// Worker gave up; no output, no outcome.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Can the task move from `self` to `next`?
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Processing)
                | (TaskState::Processing, TaskState::Completed)
                | (TaskState::Processing, TaskState::Failed)
        )
    }
}
