//! squash-core
//!
//! Concurrent image compression engine: submit a batch of images, compress
//! each one on its own task, follow per-task progress and queue status
//! through an event bus, then retrieve the outputs one by one or as a batch.
//!
//! # Modules
//! - **domain**: ids, task state and record, outcomes, events, errors
//! - **ports**: seams for injected collaborators (Codec, Clock, IdGenerator)
//! - **app**: registry, worker, dispatcher, event bus, export, config
//! - **impls**: `ImageCodec`, the default codec

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    Dispatcher, DispatcherBuilder, EngineConfig, ExportMode, ExportReport, QueueCounts,
    RegistrySnapshot, SubmitReport, Subscription,
};
pub use domain::{
    CompressionOutcome, ErrorKind, EventKind, SquashError, SquashResult, TaskEvent, TaskId,
    TaskState, TaskView,
};
