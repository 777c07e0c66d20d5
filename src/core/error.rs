use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::models::JobId;

/// Errors that end a sync run before it can report success.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Every configured source entry is missing (or the job has none).
    #[error("none of the configured sources are available")]
    NoSourcesAvailable,

    /// A read/write/stat failure on a specific file. Aborts the whole run.
    #[error("I/O error on {}: {source}", path.display())]
    CopyIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The blocking worker died (panic or runtime shutdown).
    #[error("sync worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CopyIo {
            path: path.into(),
            source,
        }
    }
}

/// Rejection from `RunSupervisor::start`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("job {0} already has a run in flight")]
    AlreadyRunning(JobId),
}

/// A job's schedule fields could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleParseError {
    #[error("invalid schedule time {0:?}, expected HH:MM")]
    InvalidTime(String),

    #[error("invalid schedule day {0:?}, expected an English weekday name")]
    InvalidDay(String),
}

/// Errors surfaced by a `JobStore`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
}

/// Non-fatal problems with individual source entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceWarning {
    /// The entry does not exist (or is not a file or directory).
    Missing(PathBuf),
}

impl std::fmt::Display for SourceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "source missing: {}", path.display()),
        }
    }
}
