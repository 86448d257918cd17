//! Error types and their operational classification.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskState;

/// Operational classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Refused at submission; never reached a worker.
    Rejected,
    /// A worker could not produce an output.
    Failed,
    /// Internal ordering defect; logged, never shown to users.
    Bug,
    /// Requested item does not exist (or is not Completed).
    Missing,
    /// Copy/archive step failed part way.
    Io,
    /// Invalid configuration.
    Config,
}

#[derive(Debug, Error)]
pub enum SquashError {
    #[error("unsupported format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("cannot resolve path: {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("source unreadable: {}: {reason}", path.display())]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("task already tracked: {0}")]
    AlreadyExists(TaskId),

    #[error("invalid transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("no completed output for {0}")]
    NotFound(String),

    #[error("i/o failure after {processed} item(s): {source}")]
    Io {
        processed: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SquashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SquashError::UnsupportedFormat { .. }
            | SquashError::InvalidPath { .. }
            | SquashError::AlreadyExists(_) => ErrorKind::Rejected,
            SquashError::SourceUnreadable { .. } => ErrorKind::Failed,
            SquashError::InvalidTransition { .. } => ErrorKind::Bug,
            SquashError::NotFound(_) => ErrorKind::Missing,
            SquashError::Io { .. } => ErrorKind::Io,
            SquashError::Config(_) => ErrorKind::Config,
        }
    }

    /// Wrap an i/o error that happened after `processed` items were done.
    pub fn io(processed: usize, source: std::io::Error) -> Self {
        SquashError::Io { processed, source }
    }
}

pub type SquashResult<T> = Result<T, SquashError>;

/// Error returned by a [`Codec`](crate::ports::Codec).
///
/// Never escapes a worker: it is folded into a Failed outcome.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot read image: {0}")]
    Unreadable(String),

    #[error("unsupported image format: {0}")]
    Unsupported(String),

    #[error("encoding failed: {0}")]
    Encode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_propagation_policy() {
        let id = TaskId::from_path("/x.png").unwrap();
        assert_eq!(
            SquashError::UnsupportedFormat { path: "/x.gif".into() }.kind(),
            ErrorKind::Rejected
        );
        assert_eq!(SquashError::AlreadyExists(id.clone()).kind(), ErrorKind::Rejected);
        assert_eq!(
            SquashError::InvalidPath {
                path: "".into(),
                reason: "empty".into()
            }
            .kind(),
            ErrorKind::Rejected
        );
        assert_eq!(
            SquashError::InvalidTransition {
                task_id: id,
                from: TaskState::Completed,
                to: TaskState::Processing,
            }
            .kind(),
            ErrorKind::Bug
        );
        assert_eq!(SquashError::NotFound("x".into()).kind(), ErrorKind::Missing);
    }

    #[test]
    fn io_error_reports_processed_count() {
        let err = SquashError::io(3, std::io::Error::other("disk full"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("after 3 item(s)"));
    }
}
