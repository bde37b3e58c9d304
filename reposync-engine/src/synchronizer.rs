//! Repository synchronizer: one repository's full update cycle.
//!
//! ## `sync`: 7-step protocol
//!
//! 1. Verify the local path is a working copy.
//! 2. Capture the `before` revision marker.
//! 3. Discard local drift (hard reset to the current head).
//! 4. Fetch and merge from the remote.
//! 5. Capture the `after` revision marker.
//! 6. `before == after` → up to date.
//! 7. Otherwise extract the ordered change list.
//!
//! Steps 3 and 4 are the only mutating ones and always run in that order,
//! so the diff in step 7 contains upstream changes only.

use std::sync::Arc;
use std::time::Duration;

use reposync_core::{ChangeEntry, RepositoryDescriptor, RevisionMarker};
use tokio_util::sync::CancellationToken;

use crate::backend::VcsBackend;
use crate::error::SyncError;
use crate::extractor::ChangeExtractor;
use crate::runner::CommandRunner;

/// Result of one repository's sync cycle.
#[derive(Debug)]
pub enum RepositoryOutcome {
    /// New upstream revisions arrived; changes are in VCS order.
    Updated(Vec<ChangeEntry>),
    UpToDate,
    Failed(SyncError),
}

impl RepositoryOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RepositoryOutcome::Failed(_))
    }
}

#[derive(Clone)]
pub struct RepositorySynchronizer {
    runner: Arc<dyn CommandRunner>,
    backend: Arc<dyn VcsBackend>,
    extractor: ChangeExtractor,
    timeout: Duration,
}

impl RepositorySynchronizer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        backend: Arc<dyn VcsBackend>,
        timeout: Duration,
    ) -> Self {
        let extractor = ChangeExtractor::new(runner.clone(), backend.clone(), timeout);
        Self {
            runner,
            backend,
            extractor,
            timeout,
        }
    }

    /// Sync one repository. Never fails past this boundary.
    pub async fn sync(&self, repo: &RepositoryDescriptor) -> RepositoryOutcome {
        self.sync_with_cancel(repo, &CancellationToken::new()).await
    }

    /// Like [`sync`](Self::sync), checking `cancel` between steps.
    ///
    /// A command already running is allowed to finish or time out; the next
    /// step is then skipped and the outcome is `Failed(Cancelled)`.
    pub async fn sync_with_cancel(
        &self,
        repo: &RepositoryDescriptor,
        cancel: &CancellationToken,
    ) -> RepositoryOutcome {
        let outcome = match self.run_steps(repo, cancel).await {
            Ok(Some(changes)) => RepositoryOutcome::Updated(changes),
            Ok(None) => RepositoryOutcome::UpToDate,
            Err(err) => RepositoryOutcome::Failed(err),
        };

        match &outcome {
            RepositoryOutcome::Updated(changes) => tracing::info!(
                repo = %repo.name,
                changes = changes.len(),
                "repository updated",
            ),
            RepositoryOutcome::UpToDate => {
                tracing::debug!(repo = %repo.name, "repository up to date")
            }
            RepositoryOutcome::Failed(err) => tracing::error!(
                repo = %repo.name,
                kind = err.kind(),
                error = %err,
                "repository sync failed",
            ),
        }
        outcome
    }

    async fn run_steps(
        &self,
        repo: &RepositoryDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ChangeEntry>>, SyncError> {
        let dir = repo.local_path.as_path();

        // Step 1
        if !self.backend.is_working_copy(dir) {
            return Err(SyncError::PathNotFound {
                path: repo.local_path.clone(),
            });
        }

        // Step 2
        ensure_live(cancel)?;
        let before = self.current_revision(repo).await?;

        // Step 3
        ensure_live(cancel)?;
        self.runner
            .run(&self.backend.discard_drift(), dir, self.timeout)
            .await
            .map_err(SyncError::Reset)?;

        // Step 4
        ensure_live(cancel)?;
        tracing::debug!(repo = %repo.name, remote = %repo.remote_url, "pulling");
        self.runner
            .run(&self.backend.pull(repo), dir, self.timeout)
            .await
            .map_err(SyncError::Pull)?;

        // Step 5
        let after = self.current_revision(repo).await?;

        // Step 6
        if before == after {
            return Ok(None);
        }

        // Step 7
        tracing::debug!(repo = %repo.name, %before, %after, "revision moved");
        let changes = self.extractor.diff(dir, &before, &after).await?;
        Ok(Some(changes))
    }

    async fn current_revision(
        &self,
        repo: &RepositoryDescriptor,
    ) -> Result<RevisionMarker, SyncError> {
        self.runner
            .run(
                &self.backend.current_revision(),
                &repo.local_path,
                self.timeout,
            )
            .await
            .map(RevisionMarker::from)
            .map_err(SyncError::Revision)
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}
