//! TaskRegistry: the single source of truth for tasks and their counters.
//!
//! All mutation goes through the operations below, each taking the lock
//! once, so a task's state, its progress and the aggregate [`QueueCounts`]
//! always move together.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use super::status::{QueueCounts, RegistrySnapshot};
use crate::domain::{
    AttemptId, CompressionOutcome, SquashError, SquashResult, TaskId, TaskOutcome, TaskRecord,
    TaskState, TaskView,
};
use crate::ports::IdGenerator;

/// Receiving side of a task's cancellation flag.
///
/// Cancelled once the registry flips the flag or forgets the task (the
/// sender is dropped on clear-all).
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Everything a worker needs to run a freshly created task.
#[derive(Debug)]
pub struct Admission {
    pub task_id: TaskId,
    pub attempt_id: AttemptId,
    pub cancel: CancelSignal,
}

/// Result of a mutation that may legitimately find nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The registry changed; counts right after the change.
    Changed(QueueCounts),
    /// The task is live but the update was not applicable (e.g. late progress).
    Ignored,
    /// Unknown task or an older attempt: already cleared.
    Stale,
}

impl Applied {
    pub fn counts(self) -> Option<QueueCounts> {
        match self {
            Applied::Changed(counts) => Some(counts),
            Applied::Ignored | Applied::Stale => None,
        }
    }
}

struct RegistryState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Submission order, for display.
    order: Vec<TaskId>,

    /// Cancellation flags of non-terminal tasks.
    cancels: HashMap<TaskId, watch::Sender<bool>>,

    /// CompletedOutcomeSet, in completion order.
    completed: Vec<CompressionOutcome>,

    counts: QueueCounts,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
            cancels: HashMap::new(),
            completed: Vec::new(),
            counts: QueueCounts::default(),
        }
    }

    /// The record for `task_id`, only if it belongs to `attempt_id`.
    fn live_record(&mut self, task_id: &TaskId, attempt_id: AttemptId) -> Option<&mut TaskRecord> {
        self.records
            .get_mut(task_id)
            .filter(|record| record.attempt_id == attempt_id)
    }
}

/// In-memory task registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskRegistry {
    state: Arc<Mutex<RegistryState>>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskRegistry {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::new())),
            ids,
        }
    }

    /// Insert a Pending task for `path` unless it is already tracked.
    ///
    /// A path that cannot be made absolute is rejected as `InvalidPath`.
    pub async fn create(&self, path: impl AsRef<Path>) -> SquashResult<Admission> {
        let path = path.as_ref();
        let task_id = TaskId::from_path(path).map_err(|e| SquashError::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock().await;
        if state.records.contains_key(&task_id) {
            return Err(SquashError::AlreadyExists(task_id));
        }

        let attempt_id = self.ids.generate_attempt_id();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        state
            .records
            .insert(task_id.clone(), TaskRecord::new(task_id.clone(), attempt_id));
        state.order.push(task_id.clone());
        state.cancels.insert(task_id.clone(), cancel_tx);
        state.counts.add(TaskState::Pending);

        debug!(task_id = %task_id, attempt_id = %attempt_id, "task created");
        Ok(Admission {
            task_id,
            attempt_id,
            cancel: CancelSignal { rx: cancel_rx },
        })
    }

    /// Pending -> Processing.
    ///
    /// A stale attempt is a no-op; any other state is `InvalidTransition`.
    pub async fn mark_processing(
        &self,
        task_id: &TaskId,
        attempt_id: AttemptId,
    ) -> SquashResult<Applied> {
        let mut state = self.state.lock().await;
        let Some(record) = state.live_record(task_id, attempt_id) else {
            return Ok(Applied::Stale);
        };
        let from = record.state;
        if let Err(err) = record.start_processing(Instant::now()) {
            warn!(error = %err, "rejected transition");
            return Err(err);
        }
        state.counts.shift(from, TaskState::Processing);
        Ok(Applied::Changed(state.counts))
    }

    /// Record progress while Processing. Never an error.
    pub async fn apply_progress(
        &self,
        task_id: &TaskId,
        attempt_id: AttemptId,
        percent: u8,
    ) -> Applied {
        let mut state = self.state.lock().await;
        let Some(record) = state.live_record(task_id, attempt_id) else {
            return Applied::Stale;
        };
        if record.apply_progress(percent) {
            Applied::Changed(state.counts)
        } else {
            Applied::Ignored
        }
    }

    /// Processing -> Completed or Failed.
    ///
    /// Counters shift and the CompletedOutcomeSet grows under the same lock
    /// as the state change.
    pub async fn mark_terminal(
        &self,
        task_id: &TaskId,
        attempt_id: AttemptId,
        outcome: TaskOutcome,
    ) -> SquashResult<Applied> {
        let mut state = self.state.lock().await;
        let Some(record) = state.live_record(task_id, attempt_id) else {
            return Ok(Applied::Stale);
        };
        let from = record.state;
        let now = Instant::now();
        let result = match outcome {
            TaskOutcome::Completed(outcome) => record
                .complete(outcome.clone(), now)
                .map(|()| Some(outcome)),
            TaskOutcome::Failed { reason, .. } => record.fail(reason, now).map(|()| None),
        };
        let completed = match result {
            Ok(completed) => completed,
            Err(err) => {
                warn!(error = %err, "rejected transition");
                return Err(err);
            }
        };
        let to = record.state;

        state.counts.shift(from, to);
        if let Some(outcome) = completed {
            state.completed.push(outcome);
        }
        state.cancels.remove(task_id);
        debug!(task_id = %task_id, state = ?to, "task finished");
        Ok(Applied::Changed(state.counts))
    }

    /// Cancel every non-terminal task, then forget everything.
    ///
    /// Returns how many tasks were still running or waiting.
    pub async fn clear_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let cancelled = state
            .records
            .values()
            .filter(|record| !record.state.is_terminal())
            .count();
        for cancel in state.cancels.values() {
            cancel.send_replace(true);
        }
        *state = RegistryState::new();
        debug!(cancelled, "registry cleared");
        cancelled
    }

    /// Consistent point-in-time view, in submission order.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock().await;
        debug_assert_eq!(
            QueueCounts::tally(state.records.values().map(|record| &record.state)),
            state.counts,
            "incremental counters drifted from the records"
        );
        let now = Instant::now();
        let tasks = state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|record| record.view(now))
            .collect();
        RegistrySnapshot {
            tasks,
            counts: state.counts,
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<TaskView> {
        let state = self.state.lock().await;
        state.records.get(task_id).map(|r| r.view(Instant::now()))
    }

    pub async fn counts(&self) -> QueueCounts {
        self.state.lock().await.counts
    }

    /// The CompletedOutcomeSet, in completion order.
    pub async fn completed_outcomes(&self) -> Vec<CompressionOutcome> {
        self.state.lock().await.completed.clone()
    }

    /// Outcome of a Completed task.
    pub async fn completed_outcome(&self, task_id: &TaskId) -> SquashResult<CompressionOutcome> {
        let state = self.state.lock().await;
        state
            .records
            .get(task_id)
            .and_then(|record| record.outcome.clone())
            .ok_or_else(|| SquashError::NotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use crate::ports::{SystemClock, UlidGenerator};
    use tracing_test::traced_test;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(UlidGenerator::new(SystemClock)))
    }

    fn outcome(path: &str) -> TaskOutcome {
        TaskOutcome::Completed(CompressionOutcome::new(
            path,
            crate::ports::output_path_for(Path::new(path)),
            100,
            40,
            "PNG",
        ))
    }

    #[tokio::test]
    async fn unresolvable_path_is_rejected_not_unreadable() {
        let reg = registry();
        let err = reg.create("").await.unwrap_err();

        assert!(matches!(err, SquashError::InvalidPath { .. }));
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(reg.counts().await.total, 0);
    }

    #[tokio::test]
    async fn create_is_idempotent_per_path() {
        let reg = registry();
        let first = reg.create("/img/a.png").await.unwrap();
        let err = reg.create("/img/./a.png").await.unwrap_err();

        assert!(matches!(err, SquashError::AlreadyExists(ref id) if *id == first.task_id));
        let counts = reg.counts().await;
        assert_eq!(counts.total, 1);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn full_lifecycle_keeps_counts_consistent() {
        let reg = registry();
        let a = reg.create("/img/a.png").await.unwrap();
        let b = reg.create("/img/b.png").await.unwrap();

        let c = reg.mark_processing(&a.task_id, a.attempt_id).await.unwrap();
        assert_eq!(c.counts().unwrap().processing, 1);
        assert!(c.counts().unwrap().is_consistent());

        reg.mark_processing(&b.task_id, b.attempt_id).await.unwrap();
        reg.mark_terminal(&a.task_id, a.attempt_id, outcome("/img/a.png"))
            .await
            .unwrap();
        let c = reg
            .mark_terminal(
                &b.task_id,
                b.attempt_id,
                TaskOutcome::failed(ErrorKind::Failed, "corrupt"),
            )
            .await
            .unwrap()
            .counts()
            .unwrap();

        assert_eq!((c.pending, c.processing, c.completed, c.failed), (0, 0, 1, 1));
        assert!(c.is_consistent());

        let snap = reg.snapshot().await;
        assert_eq!(snap.tasks[0].id, a.task_id);
        assert_eq!(snap.tasks[0].progress, 100);
        assert_eq!(snap.tasks[1].state, TaskState::Failed);
        assert_eq!(snap.tasks[1].error.as_deref(), Some("corrupt"));
        assert_eq!(reg.completed_outcomes().await.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn mark_processing_twice_is_invalid_and_logged() {
        let reg = registry();
        let a = reg.create("/img/a.png").await.unwrap();
        reg.mark_processing(&a.task_id, a.attempt_id).await.unwrap();
        let err = reg
            .mark_processing(&a.task_id, a.attempt_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SquashError::InvalidTransition { .. }));
        assert_eq!(reg.counts().await.processing, 1);
        assert!(logs_contain("rejected transition"));
    }

    #[tokio::test]
    async fn terminal_tasks_stay_terminal() {
        let reg = registry();
        let a = reg.create("/img/a.png").await.unwrap();
        reg.mark_processing(&a.task_id, a.attempt_id).await.unwrap();
        reg.mark_terminal(&a.task_id, a.attempt_id, outcome("/img/a.png"))
            .await
            .unwrap();

        let err = reg
            .mark_terminal(
                &a.task_id,
                a.attempt_id,
                TaskOutcome::failed(ErrorKind::Failed, "late"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SquashError::InvalidTransition { .. }));
        assert_eq!(
            reg.apply_progress(&a.task_id, a.attempt_id, 50).await,
            Applied::Ignored
        );

        let view = reg.get(&a.task_id).await.unwrap();
        assert_eq!(view.state, TaskState::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(reg.completed_outcomes().await.len(), 1);
    }

    #[tokio::test]
    async fn clear_all_cancels_and_empties() {
        let reg = registry();
        let a = reg.create("/img/a.png").await.unwrap();
        let b = reg.create("/img/b.png").await.unwrap();
        reg.mark_processing(&a.task_id, a.attempt_id).await.unwrap();
        assert!(!a.cancel.is_cancelled());

        assert_eq!(reg.clear_all().await, 2);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());

        let snap = reg.snapshot().await;
        assert!(snap.tasks.is_empty());
        assert_eq!(snap.counts, QueueCounts::default());
        assert!(reg.completed_outcomes().await.is_empty());
    }

    #[tokio::test]
    async fn events_from_a_cleared_attempt_are_stale() {
        let reg = registry();
        let old = reg.create("/img/a.png").await.unwrap();
        reg.mark_processing(&old.task_id, old.attempt_id).await.unwrap();
        reg.clear_all().await;

        assert_eq!(
            reg.apply_progress(&old.task_id, old.attempt_id, 10).await,
            Applied::Stale
        );

        // same path again: a new attempt
        let new = reg.create("/img/a.png").await.unwrap();
        assert_ne!(new.attempt_id, old.attempt_id);
        let late = reg
            .mark_terminal(&old.task_id, old.attempt_id, outcome("/img/a.png"))
            .await
            .unwrap();
        assert_eq!(late, Applied::Stale);
        assert_eq!(reg.get(&new.task_id).await.unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn completed_outcome_requires_completion() {
        let reg = registry();
        let a = reg.create("/img/a.png").await.unwrap();
        let err = reg.completed_outcome(&a.task_id).await.unwrap_err();
        assert!(matches!(err, SquashError::NotFound(_)));

        reg.mark_processing(&a.task_id, a.attempt_id).await.unwrap();
        reg.mark_terminal(&a.task_id, a.attempt_id, outcome("/img/a.png"))
            .await
            .unwrap();
        let found = reg.completed_outcome(&a.task_id).await.unwrap();
        assert_eq!(found.format, "PNG");
    }

    #[tokio::test]
    async fn cancel_signal_resolves_on_clear() {
        let reg = registry();
        let mut a = reg.create("/img/a.png").await.unwrap();
        let waiter = tokio::spawn(async move { a.cancel.cancelled().await });
        reg.clear_all().await;
        waiter.await.unwrap();
    }
}
