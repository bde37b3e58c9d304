use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const STATUS_FILE: &str = "status.json";
pub const STATUS_LOCK_FILE: &str = "status.lock";
pub const SYNC_LOCK_FILE: &str = "sync.lock";

pub fn reposync_root(home: &Path) -> PathBuf {
    reposync_core::config::root_dir_at(home)
}

pub fn config_path(home: &Path) -> PathBuf {
    reposync_core::config::config_path_at(home)
}

pub fn status_path(home: &Path) -> PathBuf {
    reposync_root(home).join(STATUS_FILE)
}

pub fn status_lock_path(home: &Path) -> PathBuf {
    reposync_root(home).join(STATUS_LOCK_FILE)
}

/// Held for the whole of a batch, by the daemon or a foreground `sync`.
pub fn sync_lock_path(home: &Path) -> PathBuf {
    reposync_root(home).join(SYNC_LOCK_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    reposync_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    reposync_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}
