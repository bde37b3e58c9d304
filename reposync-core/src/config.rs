//! YAML sync configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.reposync/
//!   config.yaml   (repository list + engine settings: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function touching disk has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::RepositoryDescriptor;

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Process configuration handed to the engine and daemon at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub repositories: Vec<RepositoryDescriptor>,
    /// Seconds between two scheduled batches.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Upper bound on repositories synced at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-command timeout for every VCS invocation.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            webhook_url: None,
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Reject configs the engine cannot run: zero bounds and duplicate or empty names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sync_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "command_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.name.0.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "repositories.name",
                    reason: format!("empty name for {}", repo.local_path.display()),
                });
            }
            if !seen.insert(repo.name.0.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: repo.name.0.clone(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.reposync/`
pub fn root_dir_at(home: &Path) -> PathBuf {
    home.join(".reposync")
}

/// `<home>/.reposync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_dir_at(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate the config from `<home>/.reposync/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    load_from(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

/// Load and validate a config from an explicit file path.
pub fn load_from(path: &Path) -> Result<SyncConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let config: SyncConfig = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config to `<home>/.reposync/config.yaml`.
///
/// Write flow: validate → serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let dir = root_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
