//! `keysync push <env>`: upload local env files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use keysync_core::EnvironmentName;

use super::diff::print_diff;
use super::progress::spawn_renderer;
use super::resolver::{OnConflict, PromptResolver};
use super::{home_dir, load_config, local_snapshot, orchestrator_for};

/// Arguments for `keysync push`.
#[derive(Args, Debug)]
pub struct PushArgs {
    /// Environment name.
    pub env: String,

    /// Local env files to push, merged in order (later files win).
    #[arg(long = "file", short = 'f', value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Write every key without checking the remote first.
    #[arg(long)]
    pub overwrite: bool,

    /// What to do with keys whose remote value differs.
    #[arg(long, value_enum, default_value_t = OnConflict::Abort)]
    pub on_conflict: OnConflict,

    /// Concurrent remote writes (overrides the config).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Keys per batch (overrides the config).
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Show what would change without writing anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl PushArgs {
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let home = home_dir()?;
        let cfg = load_config(&home)?;
        let environment = EnvironmentName::from(self.env);
        let local = local_snapshot(&cfg, &environment, &self.files)?;

        let mut orchestrator = orchestrator_for(&home, &cfg, &environment)?
            .with_conflict_resolver(Arc::new(PromptResolver::new(self.on_conflict)));
        if let Some(workers) = self.workers {
            orchestrator = orchestrator.with_workers(workers);
        }
        if let Some(batch_size) = self.batch_size {
            orchestrator = orchestrator.with_batch_size(batch_size);
        }

        if self.dry_run {
            let result = orchestrator
                .diff(cancel, &environment, &local)
                .await
                .with_context(|| format!("failed to diff '{environment}'"))?;
            println!("[dry-run] push {} key(s) to '{environment}'", local.len());
            print_diff(&result, "[dry-run] ");
            return Ok(());
        }

        let (progress, renderer) = spawn_renderer();
        let outcome = orchestrator
            .with_progress(progress)
            .push(cancel, &environment, &local, self.overwrite)
            .await;
        // The orchestrator owned the last sender, so the renderer drains and exits.
        let _ = renderer.await;

        let report = outcome.with_context(|| format!("failed to push '{environment}'"))?;
        println!(
            "✓ Pushed {} key(s) to '{environment}' ({} skipped, {} unchanged)",
            report.pushed, report.skipped, report.unchanged
        );
        Ok(())
    }
}
