//! Status store: per-repository sync history.
//!
//! Persists a [`StatusFile`] JSON document at `<home>/.reposync/status.json`.
//! Each writer stages into its own tmp file and renames it into place;
//! [`record_at`] holds `status.lock` across load, update and save so the
//! daemon and a foreground `sync` never drop each other's counts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use reposync_core::RepoName;
use reposync_engine::{BatchResult, BatchStatus};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};
use crate::lock::lock_status;
use crate::paths::status_path;

/// Error records kept per repository; older entries are dropped first.
pub const MAX_ERROR_HISTORY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    /// Last successful sync, updated or up to date.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// Changes pulled in by the most recent update.
    #[serde(default)]
    pub last_change_count: usize,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

impl RepoStatus {
    fn record_success(&mut self, at: DateTime<Utc>) {
        self.total_syncs += 1;
        self.successful_syncs += 1;
        self.last_sync_at = Some(at);
        self.last_attempt_at = Some(at);
    }

    fn record_failure(&mut self, at: DateTime<Utc>, kind: &str, message: String) {
        self.total_syncs += 1;
        self.failed_syncs += 1;
        self.last_attempt_at = Some(at);
        self.errors.push(ErrorRecord {
            time: at,
            kind: kind.to_string(),
            message,
        });
        if self.errors.len() > MAX_ERROR_HISTORY {
            let excess = self.errors.len() - MAX_ERROR_HISTORY;
            self.errors.drain(..excess);
        }
    }
}

/// Summary of the most recent batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub started_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub duration_ms: u64,
    pub updated: usize,
    pub up_to_date: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFile {
    #[serde(default)]
    pub last_batch: Option<BatchRecord>,
    #[serde(default)]
    pub repositories: BTreeMap<RepoName, RepoStatus>,
}

impl StatusFile {
    /// Fold one batch into the running statistics.
    pub fn record_batch(&mut self, batch: &BatchResult) {
        let at = batch.started_at;
        for (name, changes) in &batch.updates {
            let entry = self.repositories.entry(name.clone()).or_default();
            entry.record_success(at);
            entry.last_change_count = changes.len();
        }
        for name in &batch.up_to_date {
            self.repositories
                .entry(name.clone())
                .or_default()
                .record_success(at);
        }
        for (name, err) in &batch.errors {
            self.repositories
                .entry(name.clone())
                .or_default()
                .record_failure(at, err.kind(), err.to_string());
        }
        self.last_batch = Some(BatchRecord {
            started_at: batch.started_at,
            status: batch.overall_status,
            duration_ms: batch.duration_ms,
            updated: batch.updates.len(),
            up_to_date: batch.up_to_date.len(),
            failed: batch.errors.len(),
        });
    }
}

/// Load the status file; an absent file is an empty history.
pub fn load_at(home: &Path) -> Result<StatusFile, DaemonError> {
    let path = status_path(home);
    if !path.exists() {
        return Ok(StatusFile::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_at(home: &Path, status: &StatusFile) -> Result<(), DaemonError> {
    let path = status_path(home);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid status path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(status)?;
    let tmp = staging_path(&path);
    if let Err(err) = std::fs::write(&tmp, json) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&tmp, err));
    }
    std::fs::rename(&tmp, &path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        io_err(&path, e)
    })?;
    Ok(())
}

/// Load, fold in `batch`, and save while holding the status lock.
pub fn record_at(home: &Path, batch: &BatchResult) -> Result<StatusFile, DaemonError> {
    let _lock = lock_status(home)?;
    let mut status = load_at(home)?;
    status.record_batch(batch);
    save_at(home, &status)?;
    Ok(status)
}

/// `.status.json.<pid>.<seq>.tmp`, unique per process and per call.
fn staging_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}
