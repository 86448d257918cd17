//! Domain model (ids, task state, records, outcomes, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use errors::{CodecError, ErrorKind, SquashError, SquashResult};
pub use events::{EventKind, TaskEvent};
pub use ids::{AttemptId, Id, IdMarker, SubscriptionId, TaskId};
pub use outcome::{CompressionOutcome, TaskOutcome, compression_ratio};
pub use state::TaskState;
pub use task::{MAX_RUNNING_PROGRESS, TaskRecord, TaskView};
