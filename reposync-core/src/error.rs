//! Error types for reposync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading, validating, or saving the config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.reposync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}")]
    ConfigNotFound { path: PathBuf },

    /// Two repositories share the same name.
    #[error("duplicate repository name '{name}' in config")]
    DuplicateName { name: String },

    /// A field holds a value the engine cannot work with.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
