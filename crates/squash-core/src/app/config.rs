//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! gives the stock behaviour: jpg/jpeg/png/webp accepted, 100 progress steps
//! 10 ms apart, JPEG quality 85, unbounded concurrency, no per-task deadline.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{SquashError, SquashResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// File extensions accepted at submission (case-insensitive, no dot).
    pub allowed_extensions: Vec<String>,

    pub pacing: PacingPolicy,

    pub quality: QualitySettings,

    /// `None` runs every task at once. `Some(n)` caps running workers at `n`;
    /// the rest stay Pending until a slot frees up.
    pub max_concurrency: Option<usize>,

    /// Per-task deadline for the codec call. `None` waits indefinitely.
    pub task_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: ["jpg", "jpeg", "png", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            pacing: PacingPolicy::default(),
            quality: QualitySettings::default(),
            max_concurrency: None,
            task_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> SquashResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SquashError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SquashResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SquashError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> SquashResult<()> {
        if self.allowed_extensions.is_empty() {
            return Err(SquashError::Config("allowed_extensions is empty".into()));
        }
        if self.pacing.steps == 0 {
            return Err(SquashError::Config("pacing.steps must be at least 1".into()));
        }
        for (name, q) in [("jpeg", self.quality.jpeg), ("webp", self.quality.webp)] {
            if !(1..=100).contains(&q) {
                return Err(SquashError::Config(format!("quality.{name} must be 1..=100, got {q}")));
            }
        }
        if self.max_concurrency == Some(0) {
            return Err(SquashError::Config("max_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Is `path`'s extension on the allow-list?
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.trim_start_matches('.');
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}

/// Synthetic progress pacing.
///
/// Most codecs report no progress, so the worker emits `steps` evenly spaced
/// updates, `step_delay_ms` apart, before calling the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingPolicy {
    pub steps: u32,
    pub step_delay_ms: u64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            steps: 100,
            step_delay_ms: 10,
        }
    }
}

impl PacingPolicy {
    /// No delay between steps. Progress events are still emitted.
    pub fn instant() -> Self {
        Self {
            steps: 100,
            step_delay_ms: 0,
        }
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    /// Percent shown after step `i` of `steps`, before the codec has run.
    ///
    /// Spans 0..=99 evenly and is non-decreasing; 100 is left for completion.
    pub fn percent_at(&self, i: u32) -> u8 {
        if self.steps <= 1 {
            return 0;
        }
        let i = i.min(self.steps - 1);
        (u64::from(i) * 99 / u64::from(self.steps - 1)) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub jpeg: u8,
    /// WebP is re-encoded losslessly; kept for configs that carry it.
    pub webp: u8,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self { jpeg: 85, webp: 85 }
    }
}
