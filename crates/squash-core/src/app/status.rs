//! Status views: aggregate counters and point-in-time snapshots.

use serde::{Deserialize, Serialize};

use crate::domain::{TaskState, TaskView};

/// Number of tasks per state.
///
/// Maintained by the registry in the same critical section as every state
/// change, so `pending + processing + completed + failed == total` holds in
/// every copy handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl QueueCounts {
    fn slot(&mut self, state: TaskState) -> &mut usize {
        match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Processing => &mut self.processing,
            TaskState::Completed => &mut self.completed,
            TaskState::Failed => &mut self.failed,
        }
    }

    pub(crate) fn add(&mut self, state: TaskState) {
        *self.slot(state) += 1;
        self.total += 1;
    }

    pub(crate) fn shift(&mut self, from: TaskState, to: TaskState) {
        let from_slot = self.slot(from);
        *from_slot = from_slot.saturating_sub(1);
        *self.slot(to) += 1;
    }

    /// Count every state from scratch.
    pub fn tally<'a>(states: impl IntoIterator<Item = &'a TaskState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            counts.add(*state);
        }
        counts
    }

    /// No task is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }

    pub fn is_consistent(&self) -> bool {
        self.pending + self.processing + self.completed + self.failed == self.total
    }
}

/// Read-only view of the whole registry, taken under one lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Tasks in submission order.
    pub tasks: Vec<TaskView>,
    pub counts: QueueCounts,
}
