//! Task record: one submitted image and its lifecycle.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::errors::{SquashError, SquashResult};
use super::ids::{AttemptId, TaskId};
use super::outcome::CompressionOutcome;
use super::state::TaskState;

/// Highest progress a task can show before it is Completed.
///
/// 100 is reserved for Completed, so a Failed task is never seen at 100.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Single source of truth for one task.
///
/// Only the registry holds these; all transitions go through the methods
/// below so that state, progress and outcome move together.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub attempt_id: AttemptId,
    pub input_path: PathBuf,
    pub state: TaskState,

    /// 0..=100, non-decreasing while Processing; 100 iff Completed.
    pub progress: u8,

    /// Present iff Completed.
    pub outcome: Option<CompressionOutcome>,

    /// Failure reason (if Failed).
    pub last_error: Option<String>,

    /// When the task was admitted; Pending time is measured from here.
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl TaskRecord {
    pub fn new(id: TaskId, attempt_id: AttemptId) -> Self {
        let input_path = id.as_path().to_path_buf();
        Self {
            id,
            attempt_id,
            input_path,
            state: TaskState::Pending,
            progress: 0,
            outcome: None,
            last_error: None,
            created_at: Instant::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: TaskState) -> SquashResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SquashError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Pending -> Processing.
    pub fn start_processing(&mut self, now: Instant) -> SquashResult<()> {
        self.transition(TaskState::Processing)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record a progress update. Returns whether the update was accepted.
    ///
    /// Rejected unless Processing, or if it would go backwards. The stored
    /// value is capped at [`MAX_RUNNING_PROGRESS`]; an accepted 100 is kept
    /// as 99 until the task completes.
    pub fn apply_progress(&mut self, percent: u8) -> bool {
        if self.state != TaskState::Processing || percent < self.progress {
            return false;
        }
        self.progress = percent.min(MAX_RUNNING_PROGRESS);
        true
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, outcome: CompressionOutcome, now: Instant) -> SquashResult<()> {
        self.transition(TaskState::Completed)?;
        self.progress = 100;
        self.outcome = Some(outcome);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Processing -> Failed. Progress stays where it was.
    pub fn fail(&mut self, reason: String, now: Instant) -> SquashResult<()> {
        self.transition(TaskState::Failed)?;
        self.last_error = Some(reason);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Estimated seconds left: `elapsed / (progress / 100) - elapsed`.
    ///
    /// `None` unless Processing with some progress.
    pub fn remaining_secs(&self, now: Instant) -> Option<f64> {
        if self.state != TaskState::Processing || self.progress == 0 {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.started_at?).as_secs_f64();
        let fraction = f64::from(self.progress) / 100.0;
        Some((elapsed / fraction - elapsed).max(0.0))
    }

    /// Time spent Pending: until the worker started, or until `now`.
    pub fn queued_ms(&self, now: Instant) -> u64 {
        let until = self.started_at.unwrap_or(now);
        until.saturating_duration_since(self.created_at).as_millis() as u64
    }

    pub fn view(&self, now: Instant) -> TaskView {
        let elapsed_ms = self.started_at.map(|started| {
            let end = self.finished_at.unwrap_or(now);
            end.saturating_duration_since(started).as_millis() as u64
        });
        TaskView {
            id: self.id.clone(),
            input_path: self.input_path.clone(),
            state: self.state,
            progress: self.progress,
            queued_ms: self.queued_ms(now),
            elapsed_ms,
            remaining_secs: self.remaining_secs(now),
            outcome: self.outcome.clone(),
            error: self.last_error.clone(),
        }
    }
}

/// Serializable, read-only view of a task for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub input_path: PathBuf,
    pub state: TaskState,
    pub progress: u8,
    #[serde(default)]
    pub queued_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CompressionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
