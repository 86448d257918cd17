//! Events published to subscribers.

use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::TaskId;
use super::outcome::{CompressionOutcome, TaskOutcome};
use crate::app::status::QueueCounts;

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Worker started; the task is now Processing.
    Started,

    /// Synthetic progress, 0..=100.
    Progress { percent: u8 },

    /// Terminal success. Always the last event for the task.
    Completed { outcome: CompressionOutcome },

    /// Terminal failure. Always the last event for the task.
    Failed { error: ErrorKind, reason: String },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Completed { .. } | EventKind::Failed { .. })
    }
}

impl From<TaskOutcome> for EventKind {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed(outcome) => EventKind::Completed { outcome },
            TaskOutcome::Failed { error, reason } => EventKind::Failed { error, reason },
        }
    }
}

/// A task event as seen by subscribers.
///
/// `counts` is the aggregate queue status right after the event was applied
/// to the registry, so a renderer never has to query for it separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub counts: QueueCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_flat() {
        let ev = TaskEvent {
            task_id: TaskId::from_path("/a.png").unwrap(),
            kind: EventKind::Progress { percent: 42 },
            counts: QueueCounts::default(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["task_id"], "/a.png");
        assert_eq!(v["kind"], "progress");
        assert_eq!(v["percent"], 42);
        assert_eq!(v["counts"]["total"], 0);
    }

    #[test]
    fn terminal_kinds() {
        assert!(!EventKind::Started.is_terminal());
        assert!(EventKind::Failed { error: ErrorKind::Failed, reason: "x".into() }.is_terminal());
    }
}
