//! `reposync status`: per-repository sync history.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use reposync_core::config;
use reposync_daemon::status_store::{self, BatchRecord, ErrorRecord, RepoStatus, StatusFile};
use reposync_engine::BatchStatus;

use super::format_age;

/// Arguments for `reposync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let report = build_report(&home)?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    last_batch: Option<BatchRecord>,
    repositories: Vec<RepositoryReport>,
}

#[derive(Debug, Serialize)]
struct RepositoryReport {
    name: String,
    configured: bool,
    #[serde(flatten)]
    status: RepoStatus,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "repository")]
    repository: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
    #[tabled(rename = "syncs")]
    total: u64,
    #[tabled(rename = "ok")]
    ok: u64,
    #[tabled(rename = "failed")]
    failed: u64,
    #[tabled(rename = "last error")]
    last_error: String,
}

/// Configured repositories first (in config order), then repositories that
/// only remain in the history.
fn build_report(home: &Path) -> Result<StatusReport> {
    let StatusFile {
        last_batch,
        mut repositories,
    } = status_store::load_at(home).context("failed to read status store")?;

    let configured = match config::load_at(home) {
        Ok(config) => config.repositories,
        Err(reposync_core::ConfigError::ConfigNotFound { .. }) => Vec::new(),
        Err(err) => return Err(err).context("failed to load config"),
    };

    let mut rows = Vec::new();
    for repo in configured {
        rows.push(RepositoryReport {
            name: repo.name.0.clone(),
            configured: true,
            status: repositories.remove(&repo.name).unwrap_or_default(),
        });
    }
    for (name, status) in repositories {
        rows.push(RepositoryReport {
            name: name.0,
            configured: false,
            status,
        });
    }

    Ok(StatusReport {
        last_batch,
        repositories: rows,
    })
}

fn print_table(report: &StatusReport) {
    print_last_batch(report.last_batch.as_ref());
    if report.repositories.is_empty() {
        println!("No repositories configured.");
        return;
    }
    print_history(report.repositories.iter().map(|repo| {
        let label = if repo.configured {
            repo.name.clone()
        } else {
            format!("{} (removed)", repo.name)
        };
        (label, &repo.status)
    }));
}

pub(crate) fn print_last_batch(batch: Option<&BatchRecord>) {
    match batch {
        Some(batch) => println!(
            "reposync v{} | last batch {} ({}) | {} updated, {} up to date, {} failed",
            env!("CARGO_PKG_VERSION"),
            format_age(batch.started_at),
            batch_label(batch.status),
            batch.updated,
            batch.up_to_date,
            batch.failed,
        ),
        None => println!(
            "reposync v{} | no batch recorded yet",
            env!("CARGO_PKG_VERSION")
        ),
    }
}

/// One table row per `(label, history)` pair.
pub(crate) fn print_history<'a>(rows: impl IntoIterator<Item = (String, &'a RepoStatus)>) {
    let rows: Vec<StatusTableRow> = rows
        .into_iter()
        .map(|(repository, status)| StatusTableRow {
            repository,
            last_sync: status
                .last_sync_at
                .map(format_age)
                .unwrap_or_else(|| "never".to_string()),
            total: status.total_syncs,
            ok: status.successful_syncs,
            failed: status.failed_syncs,
            last_error: status.errors.last().map(describe_error).unwrap_or_default(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn describe_error(record: &ErrorRecord) -> String {
    format!("{} ({})", record.kind, format_age(record.time))
}

fn batch_label(status: BatchStatus) -> String {
    match status {
        BatchStatus::Success => "success".green().to_string(),
        BatchStatus::PartialFailure => "partial failure".yellow().to_string(),
        BatchStatus::Failure => "failure".red().to_string(),
    }
}
