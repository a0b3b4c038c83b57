//! keysync: push and pull environment variables to a remote key-value store.
//!
//! # Usage
//!
//! ```text
//! keysync init [--region <region>]
//! keysync env add <name> --path <path> [--backend parameter_store|secrets_manager] [-f FILE]...
//! keysync env list
//! keysync env remove <name>
//! keysync push <env> [-f FILE]... [--overwrite] [--on-conflict overwrite|skip|ask|abort] [--dry-run]
//! keysync pull <env> [-o FILE] [--json]
//! keysync list <env> [--json]
//! keysync diff <env> [-f FILE]...
//! keysync delete <env> --yes
//! ```

mod commands;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use commands::{
    delete::DeleteArgs, diff::DiffArgs, env::EnvCommand, init::InitArgs, list::ListArgs,
    pull::PullArgs, push::PushArgs,
};
use keysync_sync::SyncError;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "keysync",
    version,
    about = "Synchronize .env files with a remote parameter store or secret store",
    long_about = None,
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create ~/.keysync/config.yaml with default settings.
    Init(InitArgs),

    /// Manage configured environments.
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },

    /// Upload local env files to an environment.
    Push(PushArgs),

    /// Download an environment to a file or stdout.
    Pull(PullArgs),

    /// List the keys stored for an environment.
    List(ListArgs),

    /// Show what a push would change.
    Diff(DiffArgs),

    /// Delete every key of an environment.
    Delete(DeleteArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Init(args) => args.run(),
        Commands::Env { command } => commands::env::run(command),
        remote => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(run_remote(remote))
        }
    }
}

async fn run_remote(command: Commands) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted; waiting for in-flight requests");
                cancel.cancel();
            }
        })
    };

    let outcome = match command {
        Commands::Push(args) => args.run(&cancel).await,
        Commands::Pull(args) => args.run(&cancel).await,
        Commands::List(args) => args.run(&cancel).await,
        Commands::Diff(args) => args.run(&cancel).await,
        Commands::Delete(args) => args.run(&cancel).await,
        Commands::Init(_) | Commands::Env { .. } => Ok(()),
    };
    interrupt.abort();
    outcome
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Print the error chain, the hint for classified remote failures, and the
/// keys of a partial failure.
fn report_error(err: &anyhow::Error) {
    eprintln!("{} {err:#}", "error:".red().bold());

    let Some(sync_err) = err.chain().find_map(|e| e.downcast_ref::<SyncError>()) else {
        return;
    };
    if let Some(hint) = sync_err.hint() {
        eprintln!("{} {hint}", "hint:".yellow().bold());
    }
    match sync_err {
        SyncError::PartialFailure { keys, .. } => {
            eprintln!("failed keys:");
            for key in keys {
                eprintln!("  ✗ {key}");
            }
        }
        SyncError::Aborted { .. } => {
            eprintln!(
                "{} rerun with --on-conflict overwrite|skip|ask, or --overwrite",
                "hint:".yellow().bold()
            );
        }
        _ => {}
    }
}
