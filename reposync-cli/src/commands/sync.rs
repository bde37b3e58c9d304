//! `reposync sync`: one batch now.
//!
//! When the daemon answers on its socket the batch runs there, so the two
//! never touch the same working copies at once. Otherwise the batch runs in
//! this process under the shared sync lock.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use reposync_core::{config, RepositoryDescriptor};
use reposync_daemon::{lock, request_sync, status_store, BatchReport, DaemonError, SyncReport};
use reposync_engine::{BatchStatus, EngineConfig, GitBackend, ProcessRunner, SyncCoordinator};

/// Arguments for `reposync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Only sync these repositories (default: all configured).
    pub names: Vec<String>,

    /// Emit the batch result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct SyncTableRow {
    #[tabled(rename = "repository")]
    repository: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "detail")]
    detail: String,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        super::init_cli_tracing();
        let home = super::home_dir()?;

        let report = match request_sync(&home, &self.names) {
            Ok(report) => report,
            Err(DaemonError::DaemonNotRunning { .. }) => run_local(&home, &self.names)?,
            Err(err) => return Err(err).context("daemon sync request failed"),
        };
        print_report(&report, self.json)?;

        if report.batch.overall_status == BatchStatus::Failure {
            std::process::exit(1);
        }
        Ok(())
    }
}

/// Batch in this process, holding the sync lock for its whole length.
fn run_local(home: &Path, names: &[String]) -> Result<SyncReport> {
    let config = config::load_at(home)
        .context("failed to load config; create ~/.reposync/config.yaml first")?;
    let repos = select(&config.repositories, names)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let coordinator = SyncCoordinator::new(
        EngineConfig::from(&config),
        Arc::new(ProcessRunner::new().with_env("GIT_TERMINAL_PROMPT", "0")),
        Arc::new(GitBackend::new()),
    );

    let batch = {
        let _lock = lock::lock_sync(home).context("failed to take the sync lock")?;
        runtime.block_on(coordinator.sync_all(&repos))
    };
    if let Err(err) = status_store::record_at(home, &batch) {
        eprintln!("warning: failed to record sync status: {err}");
    }

    Ok(SyncReport {
        source: "cli".to_string(),
        repos: names.to_vec(),
        batch: BatchReport::from(&batch),
    })
}

pub(crate) fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report.batch).context("failed to serialize batch JSON")?
        );
    } else {
        print_batch(&report.batch);
    }
    Ok(())
}

fn select(
    repositories: &[RepositoryDescriptor],
    names: &[String],
) -> Result<Vec<RepositoryDescriptor>> {
    if names.is_empty() {
        return Ok(repositories.to_vec());
    }
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        match repositories.iter().find(|repo| repo.name.0 == *name) {
            Some(repo) => selected.push(repo.clone()),
            None => bail!("unknown repository '{name}'"),
        }
    }
    Ok(selected)
}

pub(crate) fn print_batch(batch: &BatchReport) {
    if batch.repository_count() == 0 {
        println!("No repositories configured.");
        return;
    }

    let mut rows = Vec::with_capacity(batch.repository_count());
    for (name, changes) in &batch.updates {
        rows.push(SyncTableRow {
            repository: name.to_string(),
            result: "UPDATED".green().bold().to_string(),
            detail: format!("{} changed", changes.len()),
        });
    }
    for name in &batch.up_to_date {
        rows.push(SyncTableRow {
            repository: name.to_string(),
            result: "UP TO DATE".bright_black().to_string(),
            detail: String::new(),
        });
    }
    for (name, err) in &batch.errors {
        rows.push(SyncTableRow {
            repository: name.to_string(),
            result: "FAILED".red().bold().to_string(),
            detail: format!("{}: {}", err.kind, err.message),
        });
    }
    rows.sort_by(|a, b| a.repository.cmp(&b.repository));

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for (name, changes) in &batch.updates {
        println!("{}", name.to_string().bold());
        for change in changes {
            println!("  {}  {}", status_glyph(change.kind), change.path);
        }
    }

    println!(
        "{} in {} ms: {} updated, {} up to date, {} failed",
        status_label(batch.overall_status),
        batch.duration_ms,
        batch.updates.len(),
        batch.up_to_date.len(),
        batch.errors.len(),
    );
}

fn status_glyph(kind: reposync_core::ChangeKind) -> String {
    use reposync_core::ChangeKind;
    match kind {
        ChangeKind::Added => "A".green().to_string(),
        ChangeKind::Modified => "M".yellow().to_string(),
        ChangeKind::Deleted => "D".red().to_string(),
    }
}

fn status_label(status: BatchStatus) -> String {
    match status {
        BatchStatus::Success => "SUCCESS".green().bold().to_string(),
        BatchStatus::PartialFailure => "PARTIAL FAILURE".yellow().bold().to_string(),
        BatchStatus::Failure => "FAILURE".red().bold().to_string(),
    }
}
