//! Error types for reposync-engine.
//!
//! Every failure below the synchronizer is one of these typed values; the
//! synchronizer folds them into `RepositoryOutcome::Failed` so nothing
//! escapes to the coordinator.

use std::path::PathBuf;
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Failure of a single external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process ran and exited with a non-zero status.
    #[error("`{program}` exited with {}: {stderr}", exit_label(.code))]
    ExitFailure {
        program: String,
        /// `None` when the process was terminated by a signal.
        code: Option<i32>,
        stderr: String,
    },

    /// The process could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish within its budget and was killed.
    #[error("`{program}` timed out after {}s", .timeout.as_secs_f64())]
    Timeout { program: String, timeout: Duration },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Failure while computing the change list between two revisions.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("diff command failed: {0}")]
    Command(#[from] CommandError),

    /// A name-status line carried a code other than `A`, `M` or `D`.
    #[error("unrecognized status code '{code}' in diff line {line:?}")]
    UnknownStatus { code: String, line: String },

    /// A name-status line had no tab separator between code and path.
    #[error("malformed diff line {line:?}")]
    Malformed { line: String },
}

/// Why a repository's sync cycle failed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local path is missing or is not a working copy.
    #[error("repository path not found or not a working copy: {}", .path.display())]
    PathNotFound { path: PathBuf },

    /// Reading the current revision marker failed.
    #[error("could not read current revision: {0}")]
    Revision(#[source] CommandError),

    /// Discarding local drift failed; the working copy is left as it was.
    #[error("could not discard local changes: {0}")]
    Reset(#[source] CommandError),

    /// Fetch/pull from the remote failed.
    #[error("pull failed: {0}")]
    Pull(#[source] CommandError),

    #[error("change extraction failed: {0}")]
    Diff(#[from] DiffError),

    /// Another repository in the same batch already claimed this path.
    #[error("local path {} is already synced by '{owner}' in this batch", .path.display())]
    PathInUse { path: PathBuf, owner: String },

    /// The batch was cancelled before this repository finished.
    #[error("sync cancelled")]
    Cancelled,

    /// The per-repository task died without reporting an outcome.
    #[error("sync task failed: {0}")]
    TaskFailed(String),
}

impl SyncError {
    /// Stable, machine-readable tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::PathNotFound { .. } => "path_not_found",
            SyncError::Revision(_) => "revision_error",
            SyncError::Reset(_) => "reset_error",
            SyncError::Pull(_) => "pull_error",
            SyncError::Diff(_) => "diff_error",
            SyncError::PathInUse { .. } => "path_in_use",
            SyncError::Cancelled => "cancelled",
            SyncError::TaskFailed(_) => "task_failed",
        }
    }
}

impl Serialize for SyncError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SyncError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
