//! reposync core library: domain types, sync configuration, errors.
//!
//! - [`types`]: newtypes and domain structs shared by engine and daemon
//! - [`error`]: [`ConfigError`]
//! - [`config`]: load / validate / save the YAML config

pub mod config;
pub mod error;
pub mod types;

pub use config::SyncConfig;
pub use error::ConfigError;
pub use types::{ChangeEntry, ChangeKind, RepoName, RepositoryDescriptor, RevisionMarker};
