//! # reposync-engine
//!
//! Pull-and-diff engine for a fleet of local working copies.
//!
//! - [`runner`]: run one external command with a timeout
//! - [`backend`]: VCS operations as argument vectors ([`GitBackend`])
//! - [`extractor`]: parse name-status output into [`ChangeEntry`](reposync_core::ChangeEntry)s
//! - [`synchronizer`]: one repository's update cycle
//! - [`coordinator`]: bounded-parallel batch over every repository
//!
//! Call [`SyncCoordinator::sync_all`] once per scheduling tick.

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod extractor;
pub mod runner;
pub mod synchronizer;

#[cfg(test)]
mod test_support;

pub use backend::{GitBackend, VcsBackend};
pub use coordinator::{BatchResult, BatchStatus, EngineConfig, SyncCoordinator};
pub use error::{CommandError, DiffError, SyncError};
pub use extractor::{parse_name_status, ChangeExtractor};
pub use runner::{CommandRunner, ProcessRunner};
pub use synchronizer::{RepositoryOutcome, RepositorySynchronizer};
