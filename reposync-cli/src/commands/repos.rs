//! `reposync repos`: list configured repositories.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use reposync_core::config;
use reposync_engine::{GitBackend, VcsBackend};

#[derive(Args, Debug)]
pub struct ReposArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct RepoRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "local path")]
    local_path: String,
    #[tabled(rename = "remote")]
    remote_url: String,
    #[tabled(rename = "working copy")]
    working_copy: bool,
}

impl ReposArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let config = config::load_at(&home).context("failed to load config")?;
        let git = GitBackend::new();

        let rows: Vec<RepoRow> = config
            .repositories
            .iter()
            .map(|repo| RepoRow {
                name: repo.name.0.clone(),
                local_path: repo.local_path.display().to_string(),
                remote_url: repo.remote_url.clone(),
                working_copy: git.is_working_copy(&repo.local_path),
            })
            .collect();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to serialize repos JSON")?
            );
            return Ok(());
        }

        if rows.is_empty() {
            println!("No repositories configured.");
            return Ok(());
        }
        let missing = rows.iter().filter(|row| !row.working_copy).count();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!(
            "every {}s, {} at a time",
            config.sync_interval_secs, config.max_concurrency
        );
        if missing > 0 {
            println!(
                "{}",
                format!("{missing} configured path(s) are not git working copies").yellow()
            );
        }
        Ok(())
    }
}
