//! Size-based log rotation for daemon log files.
//!
//! Rotates `daemon.log` and `daemon-err.log` once they reach 1 MiB.
//! Keeps at most 5 rotated copies:
//!   daemon.log → daemon.log.1 → daemon.log.2 → … → daemon.log.5

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_subscriber::fmt::MakeWriter;

/// Log file size that triggers rotation (1 MiB).
pub const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` if its size exceeds `max_bytes`.
///
/// `<name>.<max_files>` is dropped, every other backup shifts up by one,
/// and the live file becomes `<name>.1` with a fresh empty file in its place.
///
/// Returns `false` when the file is under the threshold or missing.
pub fn rotate_if_needed(
    log_path: &Path,
    max_bytes: u64,
    max_files: usize,
) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        let dst = numbered_path(log_path, n + 1);
        if src.exists() {
            fs::rename(&src, &dst)?;
        }
    }

    fs::rename(log_path, numbered_path(log_path, 1))?;

    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;

    Ok(true)
}

/// Rotate both daemon logs under `home`; a failure on one is only logged.
pub fn rotate_logs(home: &Path) {
    let stdout_log = crate::paths::stdout_log_path(home);
    let stderr_log = crate::paths::stderr_log_path(home);

    for log_path in [&stdout_log, &stderr_log] {
        match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed"),
        }
    }
}

/// Tracing writer that reopens its file in append mode for every event, so
/// it follows the live file across rotations.
#[derive(Debug, Clone)]
pub struct AppendLogWriter {
    path: PathBuf,
}

impl AppendLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl<'a> MakeWriter<'a> for AppendLogWriter {
    type Writer = Box<dyn io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::sink()),
        }
    }
}

fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon.log");
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL_LIMIT: u64 = 64;

    fn write_log(path: &Path, bytes: usize) {
        fs::write(path, vec![b'x'; bytes]).unwrap();
    }

    #[test]
    fn under_threshold_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write_log(&log, 10);
        assert!(!rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_first_backup() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write_log(&log, SMALL_LIMIT as usize + 1);

        assert!(rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(numbered_path(&log, 1)).unwrap().len(),
            SMALL_LIMIT + 1
        );
    }

    #[test]
    fn backups_are_capped_at_five() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        for n in 1..=MAX_ROTATED_FILES {
            fs::write(numbered_path(&log, n), format!("rotated-{n}")).unwrap();
        }
        write_log(&log, SMALL_LIMIT as usize);

        assert!(rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        assert_eq!(
            fs::read_to_string(numbered_path(&log, MAX_ROTATED_FILES)).unwrap(),
            "rotated-4"
        );
        assert!(!numbered_path(&log, MAX_ROTATED_FILES + 1).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("nonexistent.log");
        assert!(!rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
    }

    #[test]
    fn append_writer_follows_rotation() {
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        let writer = AppendLogWriter::new(&log);

        writer.make_writer().write_all(&[b'a'; 80]).unwrap();
        assert!(rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        writer.make_writer().write_all(b"after\n").unwrap();

        assert_eq!(fs::read_to_string(&log).unwrap(), "after\n");
        assert_eq!(fs::metadata(numbered_path(&log, 1)).unwrap().len(), 80);
    }

    #[test]
    fn rotate_logs_handles_both_daemon_logs() {
        let home = TempDir::new().unwrap();
        let logs = crate::paths::logs_dir(home.path());
        fs::create_dir_all(&logs).unwrap();
        let stdout = crate::paths::stdout_log_path(home.path());
        let stderr = crate::paths::stderr_log_path(home.path());
        write_log(&stdout, MAX_LOG_BYTES as usize);
        write_log(&stderr, 1);

        rotate_logs(home.path());

        assert!(numbered_path(&stdout, 1).exists());
        assert!(!numbered_path(&stderr, 1).exists());
    }
}
