//! `keysync diff <env> [-f FILE]...`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use keysync_core::EnvironmentName;
use keysync_sync::DiffResult;

use super::{home_dir, load_config, local_snapshot, orchestrator_for};

/// Compare local env files with the remote contents of an environment.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Environment name.
    pub env: String,

    /// Local env files to compare, merged in order.
    #[arg(long = "file", short = 'f', value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

impl DiffArgs {
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let home = home_dir()?;
        let cfg = load_config(&home)?;
        let environment = EnvironmentName::from(self.env);
        let local = local_snapshot(&cfg, &environment, &self.files)?;

        let orchestrator = orchestrator_for(&home, &cfg, &environment)?;
        let result = orchestrator
            .diff(cancel, &environment, &local)
            .await
            .with_context(|| format!("failed to diff '{environment}'"))?;

        print_diff(&result, "");
        Ok(())
    }
}

/// Key-level listing of `result`; values are never shown.
pub fn print_diff(result: &DiffResult, prefix: &str) {
    if result.is_empty() {
        println!("{prefix}No changes ({} unchanged).", result.unchanged);
        return;
    }
    for key in result.added.keys() {
        println!("{prefix}{} {key}", "+".green().bold());
    }
    for (key, _) in &result.modified {
        println!("{prefix}{} {key}", "~".yellow().bold());
    }
    for key in result.removed.keys() {
        println!("{prefix}{} {key} {}", "-".red().bold(), "(remote only)".dimmed());
    }
    println!("{prefix}{}, {} unchanged", result.summary(), result.unchanged);
}
