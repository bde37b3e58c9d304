//! Advisory file locks shared by the daemon and foreground CLI runs.
//!
//! Both processes may touch the same working copies and the same
//! `status.json`; an exclusive `flock` on a sidecar file serialises them.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{io_err, DaemonError};
use crate::paths::{status_lock_path, sync_lock_path};

/// Exclusive lock released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock at `path` is ours.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive().map_err(|source| DaemonError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, DaemonError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(source) => Err(DaemonError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

/// Lock guarding every working copy for the length of one batch.
pub fn lock_sync(home: &Path) -> Result<FileLock, DaemonError> {
    let path = sync_lock_path(home);
    if let Some(lock) = FileLock::try_acquire(&path)? {
        return Ok(lock);
    }
    tracing::info!(path = %path.display(), "another sync batch is running; waiting");
    FileLock::acquire(&path)
}

/// Lock guarding the load-modify-save cycle of `status.json`.
pub fn lock_status(home: &Path) -> Result<FileLock, DaemonError> {
    FileLock::acquire(&status_lock_path(home))
}

fn open_lock_file(path: &Path) -> Result<File, DaemonError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| io_err(path, e))
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
