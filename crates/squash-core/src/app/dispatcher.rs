//! Dispatcher: admits tasks, launches workers and routes their events.
//!
//! # Event path
//! worker --`WorkerEvent`--> router --registry op--> `EventBus::publish`
//!
//! The router is a single task. It applies each worker event to the
//! registry and publishes the result before looking at the next message,
//! and clear-all goes through the same loop, so nothing can be published
//! for a task after the clear that removed it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bus::{EventBus, Subscription};
use super::config::EngineConfig;
use super::export::{self, ExportMode, ExportReport};
use super::registry::{Admission, Applied, TaskRegistry};
use super::status::{QueueCounts, RegistrySnapshot};
use super::worker::{CompressionWorker, WorkerEvent, WorkerEventKind};
use crate::domain::{
    EventKind, SquashError, SquashResult, SubscriptionId, TaskEvent, TaskId, TaskView,
};
use crate::ports::Clock;

/// What happened to each path of a `submit` call.
#[derive(Debug, Default)]
pub struct SubmitReport {
    /// Newly created tasks, in submission order.
    pub accepted: Vec<TaskId>,
    /// Paths already tracked; nothing was done for them.
    pub duplicates: Vec<TaskId>,
    pub rejected: Vec<Rejection>,
}

#[derive(Debug)]
pub struct Rejection {
    pub path: PathBuf,
    pub error: SquashError,
}

enum Command {
    ClearAll(oneshot::Sender<usize>),
}

pub struct Dispatcher {
    config: EngineConfig,
    registry: TaskRegistry,
    bus: EventBus,
    worker: CompressionWorker,
    clock: Arc<dyn Clock>,
    permits: Option<Arc<Semaphore>>,
    batch_ready: Arc<AtomicBool>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    router: JoinHandle<()>,
}

impl Dispatcher {
    /// Wire everything up and start the router. Must run inside a tokio runtime.
    pub(crate) fn start(
        config: EngineConfig,
        registry: TaskRegistry,
        bus: EventBus,
        worker: CompressionWorker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let batch_ready = Arc::new(AtomicBool::new(false));
        let permits = config.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));

        let router = Router {
            registry: registry.clone(),
            bus: bus.clone(),
            batch_ready: Arc::clone(&batch_ready),
        };
        let router = tokio::spawn(router.run(worker_rx, commands_rx, shutdown_rx));

        Self {
            config,
            registry,
            bus,
            worker,
            clock,
            permits,
            batch_ready,
            worker_tx,
            commands,
            shutdown_tx,
            router,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admit every new path and start a worker for each.
    ///
    /// Unsupported extensions are rejected here, before any worker runs.
    /// Paths that are already tracked (in any state) are reported as
    /// duplicates and left alone.
    pub async fn submit<I, P>(&self, paths: I) -> SubmitReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut report = SubmitReport::default();
        for path in paths {
            let path = path.as_ref();
            if !self.config.accepts(path) {
                debug!(path = %path.display(), "rejected: unsupported extension");
                report.rejected.push(Rejection {
                    path: path.to_path_buf(),
                    error: SquashError::UnsupportedFormat {
                        path: path.to_path_buf(),
                    },
                });
                continue;
            }
            match self.registry.create(path).await {
                Ok(admission) => {
                    report.accepted.push(admission.task_id.clone());
                    self.spawn_worker(admission);
                }
                Err(SquashError::AlreadyExists(task_id)) => report.duplicates.push(task_id),
                Err(error) => report.rejected.push(Rejection {
                    path: path.to_path_buf(),
                    error,
                }),
            }
        }
        info!(
            accepted = report.accepted.len(),
            duplicates = report.duplicates.len(),
            rejected = report.rejected.len(),
            subscribers = self.bus.subscriber_count(),
            "batch submitted"
        );
        report
    }

    fn spawn_worker(&self, admission: Admission) {
        let worker = self.worker.clone();
        let events = self.worker_tx.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let task_id = admission.task_id.clone();
            let mut cancel = admission.cancel.clone();

            // bounded pool: stay Pending until a slot frees up
            let _permit = match permits {
                Some(permits) => tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                },
                None => None,
            };

            let end = worker.run(admission, &events).await;
            debug!(task_id = %task_id, end = ?end, "worker exited");
        });
    }

    /// Cancel every running worker and forget every task and outcome.
    ///
    /// Once this returns, subscribers see no further event for any task
    /// that existed before the call. Returns how many tasks were cancelled.
    pub async fn clear_all(&self) -> usize {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::ClearAll(ack_tx)).is_err() {
            // router is gone, nothing can publish any more
            self.batch_ready.store(false, Ordering::SeqCst);
            return self.registry.clear_all().await;
        }
        ack_rx.await.unwrap_or(0)
    }

    /// Cooperative cancellation of all running workers.
    ///
    /// A cancelled task has no state worth keeping, so this is the same
    /// operation as [`clear_all`](Self::clear_all).
    pub async fn cancel_all(&self) -> usize {
        self.clear_all().await
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot().await
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<TaskView> {
        self.registry.get(task_id).await
    }

    pub async fn counts(&self) -> QueueCounts {
        self.registry.counts().await
    }

    /// Set once at least one task has Completed; reset by clear-all.
    pub fn batch_ready(&self) -> bool {
        self.batch_ready.load(Ordering::SeqCst)
    }

    /// Output file of a Completed task.
    pub async fn output_path(&self, task_id: &TaskId) -> SquashResult<PathBuf> {
        Ok(self.registry.completed_outcome(task_id).await?.output_path)
    }

    /// Copy a Completed task's output to `destination`.
    pub async fn export_one(&self, task_id: &TaskId, destination: &Path) -> SquashResult<PathBuf> {
        let outcome = self.registry.completed_outcome(task_id).await?;
        export::export_one(&outcome, destination).await
    }

    /// Copy or archive every Completed output into `dest_dir`.
    pub async fn export_batch<F>(
        &self,
        dest_dir: &Path,
        mode: ExportMode,
        progress: F,
    ) -> SquashResult<ExportReport>
    where
        F: FnMut(f64) + Send + 'static,
    {
        let outcomes = self.registry.completed_outcomes().await;
        export::export_batch(outcomes, dest_dir, mode, self.clock.as_ref(), progress).await
    }

    /// Cancel everything and stop the router.
    pub async fn shutdown(self) {
        self.clear_all().await;
        self.shutdown_tx.send_replace(true);
        if let Err(err) = self.router.await {
            warn!(error = %err, "router task ended abnormally");
        }
    }
}

struct Router {
    registry: TaskRegistry,
    bus: EventBus,
    batch_ready: Arc<AtomicBool>,
}

impl Router {
    async fn run(
        self,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = worker_rx.recv() => self.route(event).await,
                else => break,
            }
        }
        // late workers see their cancel flag and go quiet
        self.registry.clear_all().await;
        debug!("router stopped");
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::ClearAll(ack) => {
                let cancelled = self.registry.clear_all().await;
                self.batch_ready.store(false, Ordering::SeqCst);
                info!(cancelled, "cleared all tasks");
                let _ = ack.send(cancelled);
            }
        }
    }

    async fn route(&self, event: WorkerEvent) {
        let WorkerEvent {
            task_id,
            attempt_id,
            kind,
        } = event;

        let (applied, published) = match kind {
            WorkerEventKind::Started => (
                self.registry.mark_processing(&task_id, attempt_id).await,
                EventKind::Started,
            ),
            WorkerEventKind::Progress(percent) => (
                Ok(self.registry.apply_progress(&task_id, attempt_id, percent).await),
                EventKind::Progress { percent },
            ),
            WorkerEventKind::Finished(outcome) => {
                let published = EventKind::from(outcome.clone());
                (
                    self.registry.mark_terminal(&task_id, attempt_id, outcome).await,
                    published,
                )
            }
        };

        // stale and rejected updates stay internal; the registry already logged rejections
        let Some(counts) = applied.ok().and_then(Applied::counts) else {
            return;
        };
        if counts.completed > 0 {
            self.batch_ready.store(true, Ordering::SeqCst);
        }
        self.bus.publish(TaskEvent {
            task_id,
            kind: published,
            counts,
        });
    }
}
