//! Scripted command runner for unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CommandError;
use crate::runner::CommandRunner;

pub(crate) enum Reply {
    Ok(&'static str),
    Fail(&'static str),
    Timeout,
    /// Cancel the token while the command is running, then succeed.
    CancelMidway(CancellationToken, &'static str),
}

/// Replies are consumed in order, per working directory. An unscripted call
/// fails with exit status 99 so a test never hangs on a missing reply.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    replies: Mutex<HashMap<PathBuf, VecDeque<Reply>>>,
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn script(&self, dir: &Path, replies: impl IntoIterator<Item = Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(dir.to_path_buf())
            .or_default()
            .extend(replies);
    }

    pub(crate) fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Second argument of every call in `dir` (`rev-parse`, `reset`, ...).
    pub(crate) fn subcommands(&self, dir: &Path) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(d, _)| d == dir)
            .map(|(_, cmd)| {
                cmd.iter()
                    .skip(1)
                    .find(|arg| !arg.starts_with('-') && !arg.contains('='))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Calls that ran to the end and produced a reply.
    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        command: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        self.calls
            .lock()
            .unwrap()
            .push((working_dir.to_path_buf(), command.to_vec()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(working_dir)
            .and_then(VecDeque::pop_front);
        let program = command.first().cloned().unwrap_or_default();
        let result = match reply {
            Some(Reply::Ok(out)) => Ok(out.to_string()),
            Some(Reply::Fail(stderr)) => Err(CommandError::ExitFailure {
                program,
                code: Some(1),
                stderr: stderr.to_string(),
            }),
            Some(Reply::Timeout) => Err(CommandError::Timeout { program, timeout }),
            Some(Reply::CancelMidway(token, out)) => {
                token.cancel();
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(out.to_string())
            }
            None => Err(CommandError::ExitFailure {
                program,
                code: Some(99),
                stderr: format!("unscripted command {command:?}"),
            }),
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}
