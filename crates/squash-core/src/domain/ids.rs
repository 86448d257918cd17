//! Domain identifiers (strongly-typed IDs).
//!
//! Two families of identifiers live here:
//!
//! - [`TaskId`] is *derived*: it is the normalised absolute path of the input
//!   image, so submitting the same file twice maps onto the same task.
//! - [`AttemptId`] and [`SubscriptionId`] are *generated*: ULIDs wrapped in the
//!   generic [`Id<T>`], where `T` is a zero-sized marker that keeps the two
//!   from being mixed up at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use ulid::Ulid;

/// Marker trait for generated id kinds.
///
/// Provides the prefix used by `Display` ("attempt-", "sub-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` is only a `PhantomData` marker; `Id<T>` has the same size as `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for one admission of a task (one worker run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn prefix() -> &'static str {
        "attempt-"
    }
}

/// Marker for an event bus subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscription {}

impl IdMarker for Subscription {
    fn prefix() -> &'static str {
        "sub-"
    }
}

/// Identifier of one admission of a task.
///
/// Worker events carry it so the registry can tell a late event from a
/// cancelled run apart from events of a later resubmission of the same path.
pub type AttemptId = Id<Attempt>;

/// Identifier of an event bus subscription.
pub type SubscriptionId = Id<Subscription>;

/// Identity of a task: the normalised absolute path of its input file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Derive the id for `path`.
    ///
    /// Relative paths are resolved against the current directory and `.`/`..`
    /// components are folded lexically; the file system is not consulted, so
    /// this works for paths that do not exist (yet).
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let absolute = std::path::absolute(path.as_ref())?;
        Ok(Self(normalize(&absolute).to_string_lossy().into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
