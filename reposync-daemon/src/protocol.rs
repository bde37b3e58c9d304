//! Control-socket wire format and the blocking client the CLI uses.
//!
//! One JSON object per line in each direction. Requests are tagged by
//! `cmd`, replies by `reply`:
//!
//! ```text
//! -> {"cmd":"sync","repos":["api"]}
//! <- {"reply":"synced","source":"socket","repos":["api"],"batch":{...}}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reposync_core::{ChangeEntry, RepoName};
use reposync_engine::{BatchResult, BatchStatus};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::status_store::{BatchRecord, RepoStatus};

/// Right after `daemon start` the socket may not be bound yet.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Status,
    /// Run a batch now; an empty list means every configured repository.
    Sync {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        repos: Vec<String>,
    },
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum DaemonResponse {
    Status(DaemonStatus),
    Synced(SyncReport),
    Stopping,
    Error { message: String },
}

impl DaemonResponse {
    pub fn error(message: impl Into<String>) -> Self {
        DaemonResponse::Error {
            message: message.into(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DaemonResponse::Status(_) => "status",
            DaemonResponse::Synced(_) => "synced",
            DaemonResponse::Stopping => "stopping",
            DaemonResponse::Error { .. } => "error",
        }
    }
}

/// Snapshot of a running daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub sync_interval_secs: u64,
    pub max_concurrency: usize,
    pub config: PathBuf,
    pub last_batch: Option<BatchRecord>,
    /// Configured repositories, in config order.
    pub repositories: Vec<RepositoryState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryState {
    pub name: RepoName,
    pub local_path: PathBuf,
    pub history: RepoStatus,
}

/// A finished batch, as returned to whoever asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// `schedule`, `socket`, or `cli`.
    pub source: String,
    #[serde(default)]
    pub repos: Vec<String>,
    pub batch: BatchReport,
}

/// Owned, deserializable form of a [`BatchResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub overall_status: BatchStatus,
    pub updates: BTreeMap<RepoName, Vec<ChangeEntry>>,
    pub up_to_date: BTreeSet<RepoName>,
    pub errors: BTreeMap<RepoName, FailureReport>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: String,
    pub message: String,
}

impl BatchReport {
    pub fn repository_count(&self) -> usize {
        self.updates.len() + self.up_to_date.len() + self.errors.len()
    }
}

impl From<&BatchResult> for BatchReport {
    fn from(batch: &BatchResult) -> Self {
        Self {
            overall_status: batch.overall_status,
            updates: batch.updates.clone(),
            up_to_date: batch.up_to_date.clone(),
            errors: batch
                .errors
                .iter()
                .map(|(name, err)| {
                    (
                        name.clone(),
                        FailureReport {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        },
                    )
                })
                .collect(),
            started_at: batch.started_at,
            duration_ms: batch.duration_ms,
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// One request, one reply. A missing or refusing socket is
/// [`DaemonError::DaemonNotRunning`].
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    let mut stream = connect(&socket)?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream
        .write_all(&line)
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut reply = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed the connection without replying".to_string(),
        ));
    }
    Ok(serde_json::from_str(reply.trim_end())?)
}

pub fn request_status(home: &Path) -> Result<DaemonStatus, DaemonError> {
    match send_with_retry(home, &DaemonRequest::Status)? {
        DaemonResponse::Status(status) => Ok(status),
        other => Err(unexpected(other, "status")),
    }
}

/// Run a batch on the daemon and wait for its report.
pub fn request_sync(home: &Path, repos: &[String]) -> Result<SyncReport, DaemonError> {
    let request = DaemonRequest::Sync {
        repos: repos.to_vec(),
    };
    match send_request(home, &request)? {
        DaemonResponse::Synced(report) => Ok(report),
        other => Err(unexpected(other, "synced")),
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    match send_request(home, &DaemonRequest::Stop)? {
        DaemonResponse::Stopping => Ok(()),
        other => Err(unexpected(other, "stopping")),
    }
}

fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    let not_running = || DaemonError::DaemonNotRunning {
        socket: socket.to_path_buf(),
    };
    if !socket.exists() {
        return Err(not_running());
    }
    UnixStream::connect(socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            not_running()
        }
        _ => io_err(socket, err),
    })
}

fn send_with_retry(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut attempt = 1;
    loop {
        match send_request(home, request) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < CONNECT_ATTEMPTS => {
                attempt += 1;
                sleep(CONNECT_BACKOFF);
            }
            result => return result,
        }
    }
}

fn unexpected(response: DaemonResponse, wanted: &str) -> DaemonError {
    match response {
        DaemonResponse::Error { message } => DaemonError::Protocol(message),
        other => DaemonError::Protocol(format!(
            "expected a '{wanted}' reply, got '{}'",
            other.label()
        )),
    }
}
