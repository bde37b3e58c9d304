//! Sync coordinator: bounded-parallel sync of every configured repository.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reposync_core::{ChangeEntry, RepoName, RepositoryDescriptor, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backend::VcsBackend;
use crate::error::SyncError;
use crate::runner::CommandRunner;
use crate::synchronizer::{RepositoryOutcome, RepositorySynchronizer};

/// Engine settings, handed in at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub command_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: reposync_core::config::DEFAULT_MAX_CONCURRENCY,
            command_timeout: Duration::from_secs(
                reposync_core::config::DEFAULT_COMMAND_TIMEOUT_SECS,
            ),
        }
    }
}

impl From<&SyncConfig> for EngineConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            command_timeout: config.command_timeout(),
        }
    }
}

/// Overall verdict for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialFailure,
    Failure,
}

impl BatchStatus {
    /// `Success` when nothing failed (including an empty batch), `Failure`
    /// when everything failed, `PartialFailure` otherwise.
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => BatchStatus::Success,
            (0, _) => BatchStatus::Failure,
            _ => BatchStatus::PartialFailure,
        }
    }
}

/// Aggregated result of one coordinator invocation.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub overall_status: BatchStatus,
    /// Repositories that received upstream changes.
    pub updates: BTreeMap<RepoName, Vec<ChangeEntry>>,
    pub up_to_date: BTreeSet<RepoName>,
    pub errors: BTreeMap<RepoName, SyncError>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BatchResult {
    /// Number of repositories accounted for in this batch.
    pub fn repository_count(&self) -> usize {
        self.updates.len() + self.up_to_date.len() + self.errors.len()
    }

    fn assemble(
        outcomes: Vec<(RepoName, RepositoryOutcome)>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        let mut updates = BTreeMap::new();
        let mut up_to_date = BTreeSet::new();
        let mut errors = BTreeMap::new();

        for (name, outcome) in outcomes {
            match outcome {
                RepositoryOutcome::Updated(changes) => {
                    updates.insert(name, changes);
                }
                RepositoryOutcome::UpToDate => {
                    up_to_date.insert(name);
                }
                RepositoryOutcome::Failed(err) => {
                    errors.insert(name, err);
                }
            }
        }

        let overall_status =
            BatchStatus::from_counts(updates.len() + up_to_date.len(), errors.len());
        Self {
            overall_status,
            updates,
            up_to_date,
            errors,
            started_at,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Drives [`RepositorySynchronizer`] across a batch with a fixed concurrency bound.
///
/// The coordinator holds no loop state; a scheduler outside the engine calls
/// [`sync_all`](Self::sync_all) once per tick.
#[derive(Clone)]
pub struct SyncCoordinator {
    config: EngineConfig,
    synchronizer: RepositorySynchronizer,
}

impl SyncCoordinator {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
        backend: Arc<dyn VcsBackend>,
    ) -> Self {
        let synchronizer = RepositorySynchronizer::new(runner, backend, config.command_timeout);
        Self {
            config,
            synchronizer,
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub async fn sync_all(&self, repos: &[RepositoryDescriptor]) -> BatchResult {
        self.sync_all_with_cancel(repos, &CancellationToken::new())
            .await
    }

    /// Sync every descriptor, at most `max_concurrency` at a time.
    ///
    /// One repository's failure never cancels another. Cancelling `cancel`
    /// marks repositories that have not finished as `Failed(Cancelled)`.
    pub async fn sync_all_with_cancel(
        &self,
        repos: &[RepositoryDescriptor],
        cancel: &CancellationToken,
    ) -> BatchResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let (scheduled, mut outcomes) = claim_working_copies(repos);

        // A zero bound would deadlock the batch; treat it as sequential.
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(scheduled.len());

        for repo in scheduled {
            let permits = permits.clone();
            let synchronizer = self.synchronizer.clone();
            let cancel = cancel.clone();
            let name = repo.name.clone();
            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RepositoryOutcome::Failed(SyncError::Cancelled),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return RepositoryOutcome::Failed(SyncError::Cancelled),
                    },
                };
                synchronizer.sync_with_cancel(&repo, &cancel).await
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(repo = %name, error = %err, "sync task join failure");
                    RepositoryOutcome::Failed(SyncError::TaskFailed(err.to_string()))
                }
            };
            outcomes.push((name, outcome));
        }

        let batch = BatchResult::assemble(outcomes, started_at, clock.elapsed());
        tracing::info!(
            status = ?batch.overall_status,
            updated = batch.updates.len(),
            up_to_date = batch.up_to_date.len(),
            failed = batch.errors.len(),
            duration_ms = batch.duration_ms,
            "sync batch finished",
        );
        batch
    }
}

/// Give every working copy to exactly one task.
///
/// Repeated names are dropped; a second name on an already-claimed path is
/// failed up front without touching the disk.
fn claim_working_copies(
    repos: &[RepositoryDescriptor],
) -> (Vec<RepositoryDescriptor>, Vec<(RepoName, RepositoryOutcome)>) {
    let mut names = HashSet::new();
    let mut owners: HashMap<PathBuf, RepoName> = HashMap::new();
    let mut scheduled = Vec::new();
    let mut rejected = Vec::new();

    for repo in repos {
        if !names.insert(repo.name.clone()) {
            tracing::warn!(repo = %repo.name, "duplicate repository in batch; syncing it once");
            continue;
        }
        let key = normalize_path(&repo.local_path);
        if let Some(owner) = owners.get(&key) {
            rejected.push((
                repo.name.clone(),
                RepositoryOutcome::Failed(SyncError::PathInUse {
                    path: repo.local_path.clone(),
                    owner: owner.0.clone(),
                }),
            ));
            continue;
        }
        owners.insert(key, repo.name.clone());
        scheduled.push(repo.clone());
    }
    (scheduled, rejected)
}

fn normalize_path(path: &std::path::Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.components().collect())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::backend::GitBackend;
    use crate::test_support::{Reply, ScriptedRunner};

    fn working_copy(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join(".git")).expect("mkdir");
        dir
    }

    fn up_to_date_script(runner: &ScriptedRunner, dir: &Path) {
        runner.script(
            dir,
            [
                Reply::Ok("abc123"),
                Reply::Ok(""),
                Reply::Ok(""),
                Reply::Ok("abc123"),
            ],
        );
    }

    fn coordinator(runner: Arc<ScriptedRunner>, max_concurrency: usize) -> SyncCoordinator {
        SyncCoordinator::new(
            EngineConfig {
                max_concurrency,
                command_timeout: Duration::from_secs(5),
            },
            runner,
            Arc::new(GitBackend::new()),
        )
    }

    #[test]
    fn status_from_counts() {
        assert_eq!(BatchStatus::from_counts(3, 0), BatchStatus::Success);
        assert_eq!(BatchStatus::from_counts(0, 0), BatchStatus::Success);
        assert_eq!(BatchStatus::from_counts(2, 1), BatchStatus::PartialFailure);
        assert_eq!(BatchStatus::from_counts(0, 4), BatchStatus::Failure);
    }

    #[tokio::test]
    async fn single_updated_repo_is_success() {
        let root = TempDir::new().expect("root");
        let dir = working_copy(root.path(), "A");
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(
            &dir,
            [
                Reply::Ok("abc123"),
                Reply::Ok(""),
                Reply::Ok(""),
                Reply::Ok("def456"),
                Reply::Ok("M\tREADME.md"),
            ],
        );

        let batch = coordinator(runner, 3)
            .sync_all(&[RepositoryDescriptor::new("A", "", &dir)])
            .await;

        assert_eq!(batch.overall_status, BatchStatus::Success);
        assert_eq!(
            batch.updates.get(&RepoName::from("A")),
            Some(&vec![ChangeEntry::modified("README.md")])
        );
        assert!(batch.errors.is_empty());
        assert!(batch.up_to_date.is_empty());
    }

    #[tokio::test]
    async fn invalid_path_isolated_as_partial_failure() {
        let root = TempDir::new().expect("root");
        let runner = Arc::new(ScriptedRunner::new());
        let mut repos = Vec::new();
        for i in 0..5 {
            let name = format!("repo{i}");
            if i == 2 {
                repos.push(RepositoryDescriptor::new(name, "", root.path().join("missing")));
                continue;
            }
            let dir = working_copy(root.path(), &name);
            up_to_date_script(&runner, &dir);
            repos.push(RepositoryDescriptor::new(name, "", dir));
        }

        let batch = coordinator(runner, 3).sync_all(&repos).await;

        assert_eq!(batch.overall_status, BatchStatus::PartialFailure);
        assert_eq!(batch.repository_count(), 5);
        assert_eq!(batch.errors.len(), 1);
        assert!(matches!(
            batch.errors.get(&RepoName::from("repo2")),
            Some(SyncError::PathNotFound { .. })
        ));
        assert_eq!(batch.up_to_date.len(), 4);
    }

    #[tokio::test]
    async fn all_failed_is_failure() {
        let root = TempDir::new().expect("root");
        let runner = Arc::new(ScriptedRunner::new());
        let repos = vec![
            RepositoryDescriptor::new("a", "", root.path().join("a")),
            RepositoryDescriptor::new("b", "", root.path().join("b")),
        ];

        let batch = coordinator(runner, 3).sync_all(&repos).await;

        assert_eq!(batch.overall_status, BatchStatus::Failure);
        assert_eq!(batch.errors.len(), 2);
        assert!(batch.updates.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_success() {
        let runner = Arc::new(ScriptedRunner::new());
        let batch = coordinator(runner, 3).sync_all(&[]).await;
        assert_eq!(batch.overall_status, BatchStatus::Success);
        assert_eq!(batch.repository_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_more_than_bound_in_flight() {
        let root = TempDir::new().expect("root");
        let runner = Arc::new(ScriptedRunner::with_delay(Duration::from_millis(20)));
        let repos: Vec<_> = (0..10)
            .map(|i| {
                let name = format!("repo{i}");
                let dir = working_copy(root.path(), &name);
                up_to_date_script(&runner, &dir);
                RepositoryDescriptor::new(name, "", dir)
            })
            .collect();

        let batch = coordinator(runner.clone(), 3).sync_all(&repos).await;

        assert_eq!(batch.overall_status, BatchStatus::Success);
        assert_eq!(batch.up_to_date.len(), 10);
        assert!(runner.max_in_flight() <= 3, "saw {}", runner.max_in_flight());
        assert!(runner.max_in_flight() >= 2, "bound should allow parallelism");
    }

    #[tokio::test]
    async fn duplicate_name_is_synced_once() {
        let root = TempDir::new().expect("root");
        let dir = working_copy(root.path(), "api");
        let runner = Arc::new(ScriptedRunner::new());
        up_to_date_script(&runner, &dir);
        let repo = RepositoryDescriptor::new("api", "", &dir);

        let batch = coordinator(runner.clone(), 3)
            .sync_all(&[repo.clone(), repo])
            .await;

        assert_eq!(batch.repository_count(), 1);
        assert_eq!(runner.subcommands(&dir).len(), 4);
    }

    #[tokio::test]
    async fn shared_local_path_is_rejected_for_second_name() {
        let root = TempDir::new().expect("root");
        let dir = working_copy(root.path(), "api");
        let runner = Arc::new(ScriptedRunner::new());
        up_to_date_script(&runner, &dir);

        let batch = coordinator(runner, 3)
            .sync_all(&[
                RepositoryDescriptor::new("api", "", &dir),
                RepositoryDescriptor::new("api-alias", "", &dir),
            ])
            .await;

        assert_eq!(batch.overall_status, BatchStatus::PartialFailure);
        assert!(batch.up_to_date.contains(&RepoName::from("api")));
        match batch.errors.get(&RepoName::from("api-alias")) {
            Some(SyncError::PathInUse { owner, .. }) => assert_eq!(owner, "api"),
            other => panic!("expected PathInUse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_batch_reports_every_repo_as_cancelled() {
        let root = TempDir::new().expect("root");
        let runner = Arc::new(ScriptedRunner::new());
        let repos: Vec<_> = (0..3)
            .map(|i| {
                let name = format!("repo{i}");
                RepositoryDescriptor::new(name.clone(), "", working_copy(root.path(), &name))
            })
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = coordinator(runner.clone(), 1)
            .sync_all_with_cancel(&repos, &cancel)
            .await;

        assert_eq!(batch.overall_status, BatchStatus::Failure);
        assert!(batch
            .errors
            .values()
            .all(|err| matches!(err, SyncError::Cancelled)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_batch_fails_running_and_queued_repos() {
        let root = TempDir::new().expect("root");
        let runner = Arc::new(ScriptedRunner::new());
        let cancel = CancellationToken::new();
        let mut dirs = Vec::new();
        let repos: Vec<_> = (0..3)
            .map(|i| {
                let name = format!("repo{i}");
                let dir = working_copy(root.path(), &name);
                // Whichever repository gets the single permit cancels the batch.
                runner.script(
                    &dir,
                    [
                        Reply::Ok("abc123"),
                        Reply::CancelMidway(cancel.clone(), ""),
                        Reply::Ok(""),
                        Reply::Ok("def456"),
                    ],
                );
                dirs.push(dir.clone());
                RepositoryDescriptor::new(name, "", dir)
            })
            .collect();

        let batch = coordinator(runner.clone(), 1)
            .sync_all_with_cancel(&repos, &cancel)
            .await;

        assert_eq!(batch.overall_status, BatchStatus::Failure);
        assert_eq!(batch.errors.len(), 3);
        assert!(batch
            .errors
            .values()
            .all(|err| matches!(err, SyncError::Cancelled)));

        let started: Vec<Vec<String>> = dirs
            .iter()
            .map(|dir| runner.subcommands(dir))
            .filter(|calls| !calls.is_empty())
            .collect();
        assert_eq!(started, vec![vec!["rev-parse".to_string(), "reset".to_string()]]);
        assert_eq!(runner.completed(), 2);
    }

    #[test]
    fn batch_serializes_errors_with_kind() {
        let mut errors = BTreeMap::new();
        errors.insert(RepoName::from("x"), SyncError::Cancelled);
        let batch = BatchResult {
            overall_status: BatchStatus::Failure,
            updates: BTreeMap::new(),
            up_to_date: BTreeSet::new(),
            errors,
            started_at: Utc::now(),
            duration_ms: 5,
        };
        let value = serde_json::to_value(&batch).expect("json");
        assert_eq!(value["overall_status"], "failure");
        assert_eq!(value["errors"]["x"]["kind"], "cancelled");
    }
}
