//! App: the orchestration engine built on top of the ports.
//!
//! # Components
//! - **TaskRegistry**: single source of truth for tasks and queue counts
//! - **CompressionWorker**: runs one task (pacing, codec call, outcome)
//! - **Dispatcher**: admits tasks, spawns workers, routes their events
//! - **EventBus**: ordered fan-out of task events to subscribers
//! - **export**: single and batch retrieval of completed outputs
//! - **DispatcherBuilder**: wiring and config validation

pub mod builder;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod export;
pub mod registry;
pub mod status;
pub mod worker;

pub use self::builder::DispatcherBuilder;
pub use self::bus::{EventBus, Subscription};
pub use self::config::{EngineConfig, PacingPolicy, QualitySettings};
pub use self::dispatcher::{Dispatcher, Rejection, SubmitReport};
pub use self::export::{ExportMode, ExportReport};
pub use self::registry::{Admission, Applied, CancelSignal, TaskRegistry};
pub use self::status::{QueueCounts, RegistrySnapshot};
pub use self::worker::{CompressionWorker, RunEnd, WorkerEvent, WorkerEventKind};
