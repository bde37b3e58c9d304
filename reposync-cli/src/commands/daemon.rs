//! `reposync daemon`: run the periodic sync loop or talk to it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;

use reposync_daemon::paths::{socket_path, stderr_log_path, stdout_log_path};
use reposync_daemon::{
    request_status, request_stop, request_sync, start_blocking, DaemonError, DaemonStatus,
};
use reposync_engine::BatchStatus;

use super::format_age;
use super::status::{print_history, print_last_batch};
use super::sync::print_report;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until ctrl-c, SIGTERM or `daemon stop`.
    Start,
    /// Ask a running daemon to shut down.
    Stop,
    /// Show the running daemon and its per-repository history.
    Status(DaemonStatusArgs),
    /// Have the running daemon sync now and wait for the result.
    Sync(DaemonSyncArgs),
    /// Print the tail of the daemon logs.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStatusArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DaemonSyncArgs {
    /// Repositories to sync (default: all configured).
    pub repos: Vec<String>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Lines to show from each log.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Only the warnings-and-errors log.
    #[arg(long)]
    pub errors_only: bool,
}

/// `daemon status --json` output. Daemon fields are absent when not running.
#[derive(Serialize)]
struct StatusJson<'a> {
    running: bool,
    socket: PathBuf,
    #[serde(flatten)]
    daemon: Option<&'a DaemonStatus>,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home_dir()?;

    match command {
        DaemonCommand::Start => start_blocking(&home).context("daemon exited with error"),
        DaemonCommand::Stop => stop(&home),
        DaemonCommand::Status(args) => status(&home, args.json),
        DaemonCommand::Sync(args) => {
            let report = request_sync(&home, &args.repos).context("daemon sync request failed")?;
            print_report(&report, args.json)?;
            if report.batch.overall_status == BatchStatus::Failure {
                std::process::exit(1);
            }
            Ok(())
        }
        DaemonCommand::Logs(args) => {
            let mut logs = vec![stderr_log_path(&home)];
            if !args.errors_only {
                logs.insert(0, stdout_log_path(&home));
            }
            for log in logs {
                print_tail(&log, args.lines)?;
            }
            Ok(())
        }
    }
}

fn stop(home: &Path) -> Result<()> {
    match request_stop(home) {
        Ok(()) => println!("daemon is shutting down"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

fn status(home: &Path, json: bool) -> Result<()> {
    let daemon = match request_status(home) {
        Ok(status) => Some(status),
        Err(DaemonError::DaemonNotRunning { .. }) => None,
        Err(err) => return Err(err).context("failed to query daemon status"),
    };

    if json {
        let payload = StatusJson {
            running: daemon.is_some(),
            socket: socket_path(home),
            daemon: daemon.as_ref(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize daemon status")?
        );
        return Ok(());
    }

    let Some(daemon) = daemon else {
        println!(
            "{} (no answer on {})",
            "daemon not running".yellow(),
            socket_path(home).display()
        );
        return Ok(());
    };
    println!(
        "{} pid {} | started {} | every {}s, {} at a time | {}",
        "daemon running".green().bold(),
        daemon.pid,
        format_age(daemon.started_at),
        daemon.sync_interval_secs,
        daemon.max_concurrency,
        daemon.config.display(),
    );
    print_last_batch(daemon.last_batch.as_ref());
    if daemon.repositories.is_empty() {
        println!("No repositories configured.");
        return Ok(());
    }
    print_history(
        daemon
            .repositories
            .iter()
            .map(|repo| (repo.name.to_string(), &repo.history)),
    );
    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("no log at {}", path.display());
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };

    let all: Vec<&str> = contents.lines().collect();
    println!("==> {} <==", path.display());
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{line}");
    }
    Ok(())
}
