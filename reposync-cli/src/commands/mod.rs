pub mod daemon;
pub mod repos;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Compact age such as `42s`, `5m`, `3h`, `2d`.
pub(crate) fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0);
    if seconds < 60 {
        return format!("{seconds}s ago");
    }
    if seconds < 60 * 60 {
        return format!("{}m ago", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h ago", seconds / (60 * 60));
    }
    format!("{}d ago", seconds / (60 * 60 * 24))
}

/// Engine warnings go to stderr; `RUST_LOG` overrides.
pub(crate) fn init_cli_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
