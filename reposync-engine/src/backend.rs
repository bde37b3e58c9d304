//! Version-control backends.
//!
//! The engine needs only four operations from a VCS, plus a cheap probe for
//! "is this directory a working copy". A backend translates each of them
//! into an argument vector for the [`CommandRunner`](crate::CommandRunner).

use std::path::Path;

use reposync_core::{RepositoryDescriptor, RevisionMarker};

pub trait VcsBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// True when `path` is a directory this backend can operate on.
    fn is_working_copy(&self, path: &Path) -> bool;

    /// Print the current revision marker on stdout.
    fn current_revision(&self) -> Vec<String>;

    /// Throw away uncommitted local modifications, back to the current head.
    fn discard_drift(&self) -> Vec<String>;

    /// Fetch from the remote and merge into the working copy.
    fn pull(&self, repo: &RepositoryDescriptor) -> Vec<String>;

    /// List changed paths between two markers, one `<code>\t<path>` per line.
    fn changed_paths(&self, before: &RevisionMarker, after: &RevisionMarker) -> Vec<String>;
}

/// `git` command-line backend.
#[derive(Debug, Clone)]
pub struct GitBackend {
    program: String,
}

impl Default for GitBackend {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `git` executable instead of the one on `$PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(args.iter().map(|arg| (*arg).to_string()))
            .collect()
    }
}

impl VcsBackend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    fn is_working_copy(&self, path: &Path) -> bool {
        // `.git` is a directory in a normal clone and a file in a linked worktree.
        path.is_dir() && path.join(".git").exists()
    }

    fn current_revision(&self) -> Vec<String> {
        self.command(&["rev-parse", "HEAD"])
    }

    fn discard_drift(&self) -> Vec<String> {
        self.command(&["reset", "--hard", "HEAD"])
    }

    fn pull(&self, _repo: &RepositoryDescriptor) -> Vec<String> {
        // Pulls from the branch's configured upstream; the descriptor's URL
        // is what that upstream was cloned from.
        self.command(&["pull", "--no-edit", "--no-rebase"])
    }

    fn changed_paths(&self, before: &RevisionMarker, after: &RevisionMarker) -> Vec<String> {
        self.command(&[
            "-c",
            "core.quotepath=off",
            "diff",
            "--name-status",
            "--no-renames",
            before.as_str(),
            after.as_str(),
        ])
    }
}
