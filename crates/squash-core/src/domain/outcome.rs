//! Outcome model: the result a worker delivers for its task.
//!
//! Failures are data, not errors: a worker always ends with exactly one
//! [`TaskOutcome`], whichever way the codec call went.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;

/// Structured result of a successful compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionOutcome {
    pub original_path: PathBuf,
    pub output_path: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,

    /// Percentage saved, rounded to two decimals. Negative if the file grew.
    pub compression_ratio: f64,

    /// Detected format, upper-case (`JPEG`, `PNG`, `WEBP`).
    pub format: String,
}

impl CompressionOutcome {
    pub fn new(
        original_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        original_size: u64,
        compressed_size: u64,
        format: impl Into<String>,
    ) -> Self {
        Self {
            original_path: original_path.into(),
            output_path: output_path.into(),
            original_size,
            compressed_size,
            compression_ratio: compression_ratio(original_size, compressed_size),
            format: format.into(),
        }
    }

    /// Bytes saved (negative if the output is larger than the input).
    pub fn saved_bytes(&self) -> i64 {
        self.original_size as i64 - self.compressed_size as i64
    }
}

/// `round((1 - compressed / original) * 100, 2)`; 0 for an empty original.
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let ratio = (1.0 - compressed_size as f64 / original_size as f64) * 100.0;
    (ratio * 100.0).round() / 100.0
}

/// Terminal result of one worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed(CompressionOutcome),
    Failed { error: ErrorKind, reason: String },
}

impl TaskOutcome {
    pub fn failed(error: ErrorKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            error,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}
