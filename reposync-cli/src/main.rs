//! reposync: keep a fleet of local git working copies in step with upstream.
//!
//! # Usage
//!
//! ```text
//! reposync sync [NAME]... [--json]
//! reposync status [--json]
//! reposync repos [--json]
//! reposync daemon start|stop|status|sync|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, repos::ReposArgs, status::StatusArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "reposync",
    version,
    about = "Pull every configured repository and report what changed",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync batch now and print the per-repository result.
    Sync(SyncArgs),

    /// Show sync history recorded in the status store.
    Status(StatusArgs),

    /// List configured repositories.
    Repos(ReposArgs),

    /// Run or control the periodic sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Repos(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
