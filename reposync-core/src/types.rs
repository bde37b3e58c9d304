//! Domain types for the repository sync engine.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are serializable/deserializable via serde.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a tracked repository. Unique within a config.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(pub String);

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RepoName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RepoName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque identifier of a working copy's state (a commit hash for git).
///
/// Only ever compared for equality; never parsed or ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionMarker(pub String);

impl RevisionMarker {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RevisionMarker {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RevisionMarker {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of change a path underwent between two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Map a name-status code to a change kind. Only `A`, `M` and `D` are known.
    pub fn from_status_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(ChangeKind::Added),
            "M" => Some(ChangeKind::Modified),
            "D" => Some(ChangeKind::Deleted),
            _ => None,
        }
    }

    /// The single-letter status code this kind was parsed from.
    pub fn status_code(self) -> &'static str {
        match self {
            ChangeKind::Added => "A",
            ChangeKind::Modified => "M",
            ChangeKind::Deleted => "D",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A repository the engine keeps in sync. Owned by the config; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: RepoName,
    #[serde(default)]
    pub remote_url: String,
    /// Absolute path to the local working copy.
    pub local_path: PathBuf,
}

impl RepositoryDescriptor {
    pub fn new(
        name: impl Into<RepoName>,
        remote_url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            remote_url: remote_url.into(),
            local_path: local_path.into(),
        }
    }
}

/// One changed path between two revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangeEntry {
    pub fn added(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Added,
        }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
