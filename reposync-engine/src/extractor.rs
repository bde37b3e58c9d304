//! Change extractor: the ordered list of paths changed between two revisions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reposync_core::{ChangeEntry, ChangeKind, RevisionMarker};

use crate::backend::VcsBackend;
use crate::error::DiffError;
use crate::runner::CommandRunner;

/// Runs the backend's name-status diff and parses it into [`ChangeEntry`]s.
#[derive(Clone)]
pub struct ChangeExtractor {
    runner: Arc<dyn CommandRunner>,
    backend: Arc<dyn VcsBackend>,
    timeout: Duration,
}

impl ChangeExtractor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        backend: Arc<dyn VcsBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            backend,
            timeout,
        }
    }

    /// Changes between `before` and `after`, in the order the VCS reports them.
    ///
    /// Equal markers short-circuit to an empty list without running anything.
    pub async fn diff(
        &self,
        working_dir: &Path,
        before: &RevisionMarker,
        after: &RevisionMarker,
    ) -> Result<Vec<ChangeEntry>, DiffError> {
        if before == after {
            return Ok(Vec::new());
        }
        let command = self.backend.changed_paths(before, after);
        let output = self.runner.run(&command, working_dir, self.timeout).await?;
        parse_name_status(&output)
    }
}

/// Parse `<code>\t<path>` lines. Blank lines are ignored; every other line
/// must carry a known code or the whole parse fails.
pub fn parse_name_status(output: &str) -> Result<Vec<ChangeEntry>, DiffError> {
    let mut changes = Vec::new();
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let Some((code, path)) = line.split_once('\t') else {
            return Err(DiffError::Malformed {
                line: line.to_string(),
            });
        };
        let code = code.trim();
        let kind = ChangeKind::from_status_code(code).ok_or_else(|| DiffError::UnknownStatus {
            code: code.to_string(),
            line: line.to_string(),
        })?;
        if path.is_empty() {
            return Err(DiffError::Malformed {
                line: line.to_string(),
            });
        }
        changes.push(ChangeEntry {
            path: path.to_string(),
            kind,
        });
    }
    Ok(changes)
}
