//! CompressionWorker: runs one task to its terminal outcome.
//!
//! # Flow
//! 1. `Started`
//! 2. source check (`metadata`) and codec `probe`; failures end here
//! 3. paced progress 0..=99, checking for cancellation between steps
//! 4. codec `encode` (optionally under a deadline)
//! 5. write `<name>_compressed<ext>`
//! 6. on success `Progress(100)` then `Finished(Completed)`,
//!    otherwise `Finished(Failed)`
//!
//! A worker never touches the registry. It only sends [`WorkerEvent`]s,
//! tagged with its attempt id, and goes quiet as soon as it is cancelled.
//!
//! Codec calls are guarded: an error, a panic or a missed deadline all end
//! as `Finished(Failed)`. The output file is written by the worker only
//! after a successful encode, so a Failed or cancelled task writes nothing.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::config::PacingPolicy;
use super::registry::{Admission, CancelSignal};
use crate::domain::{
    AttemptId, CodecError, CompressionOutcome, ErrorKind, SquashError, TaskId, TaskOutcome,
};
use crate::ports::{Codec, Encoded, output_path_for};

/// Message from a worker to the dispatcher's router.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub task_id: TaskId,
    pub attempt_id: AttemptId,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    Started,
    Progress(u8),
    Finished(TaskOutcome),
}

/// How a run ended, from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Failed,
    /// Cancelled, or nobody is listening any more. Nothing further was sent.
    Abandoned,
}

/// Sends events for one attempt; reports `false` once the router is gone.
struct EventSink<'a> {
    tx: &'a mpsc::UnboundedSender<WorkerEvent>,
    task_id: &'a TaskId,
    attempt_id: AttemptId,
}

impl EventSink<'_> {
    fn emit(&self, kind: WorkerEventKind) -> bool {
        self.tx
            .send(WorkerEvent {
                task_id: self.task_id.clone(),
                attempt_id: self.attempt_id,
                kind,
            })
            .is_ok()
    }
}

#[derive(Clone)]
pub struct CompressionWorker {
    codec: Arc<dyn Codec>,
    pacing: PacingPolicy,
    timeout: Option<Duration>,
}

impl CompressionWorker {
    pub fn new(codec: Arc<dyn Codec>, pacing: PacingPolicy, timeout: Option<Duration>) -> Self {
        Self {
            codec,
            pacing,
            timeout,
        }
    }

    pub async fn run(
        &self,
        admission: Admission,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> RunEnd {
        let Admission {
            task_id,
            attempt_id,
            mut cancel,
        } = admission;
        let sink = EventSink {
            tx: events,
            task_id: &task_id,
            attempt_id,
        };

        if cancel.is_cancelled() || !sink.emit(WorkerEventKind::Started) {
            return RunEnd::Abandoned;
        }
        debug!(task_id = %task_id, attempt_id = %attempt_id, "worker started");

        let outcome = match self.process(task_id.as_path(), &mut cancel, &sink).await {
            Some(outcome) => outcome,
            None => {
                debug!(task_id = %task_id, "worker abandoned");
                return RunEnd::Abandoned;
            }
        };

        // a cancel that lands during the codec call still wins
        if cancel.is_cancelled() {
            return RunEnd::Abandoned;
        }
        let end = if outcome.is_success() {
            if !sink.emit(WorkerEventKind::Progress(100)) {
                return RunEnd::Abandoned;
            }
            RunEnd::Completed
        } else {
            RunEnd::Failed
        };
        if let TaskOutcome::Failed { reason, .. } = &outcome {
            debug!(task_id = %task_id, reason = %reason, "compression failed");
        }
        if !sink.emit(WorkerEventKind::Finished(outcome)) {
            return RunEnd::Abandoned;
        }
        end
    }

    /// Steps 2-5. `None` means stop silently.
    async fn process(
        &self,
        input: &Path,
        cancel: &mut CancelSignal,
        sink: &EventSink<'_>,
    ) -> Option<TaskOutcome> {
        let original_size = match check_source(input).await {
            Ok(size) => size,
            Err(reason) => return Some(unreadable(input, reason)),
        };
        if let Err(reason) = guarded(self.codec.probe(input)).await {
            return Some(unreadable(input, reason));
        }

        let delay = self.pacing.step_delay();
        for step in 0..self.pacing.steps {
            let percent = self.pacing.percent_at(step);
            if cancel.is_cancelled() || !sink.emit(WorkerEventKind::Progress(percent)) {
                return None;
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        if cancel.is_cancelled() {
            return None;
        }

        let encoded = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.encode(input) => result,
        };
        // a cancel that lands during the encode means nothing gets written
        if cancel.is_cancelled() {
            return None;
        }
        let outcome = match encoded {
            Ok(encoded) => write_output(input, original_size, encoded).await,
            Err(reason) => Err(reason),
        };
        Some(match outcome {
            Ok(outcome) => TaskOutcome::Completed(outcome),
            Err(reason) => TaskOutcome::failed(ErrorKind::Failed, reason),
        })
    }

    async fn encode(&self, input: &Path) -> Result<Encoded, String> {
        let call = guarded(self.codec.encode(input));
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| format!("timed out after {} ms", limit.as_millis()))?,
            None => call.await,
        }
    }
}

/// Await a codec call, turning a panic into an ordinary failure.
async fn guarded<T, F>(call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, CodecError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!(panic = message, "codec panicked");
            Err(format!("codec panicked: {message}"))
        }
    }
}

fn panic_message<'a>(panic: &'a (dyn Any + Send + 'static)) -> &'a str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Size of the source, or why it cannot be used.
async fn check_source(input: &Path) -> Result<u64, String> {
    let meta = tokio::fs::metadata(input).await.map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".into());
    }
    Ok(meta.len())
}

async fn write_output(
    input: &Path,
    original_size: u64,
    encoded: Encoded,
) -> Result<CompressionOutcome, String> {
    let output = output_path_for(input);
    if let Err(err) = tokio::fs::write(&output, &encoded.bytes).await {
        // a partial file must not outlive the failure
        let _ = tokio::fs::remove_file(&output).await;
        return Err(format!("writing {}: {err}", output.display()));
    }
    Ok(CompressionOutcome::new(
        input,
        output,
        original_size,
        encoded.bytes.len() as u64,
        encoded.format,
    ))
}

fn unreadable(input: &Path, reason: String) -> TaskOutcome {
    let err = SquashError::SourceUnreadable {
        path: input.to_path_buf(),
        reason,
    };
    TaskOutcome::failed(err.kind(), err.to_string())
}
