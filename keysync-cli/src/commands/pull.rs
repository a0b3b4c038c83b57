//! `keysync pull <env> [-o FILE] [--json]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use keysync_core::{env_file, EnvironmentName};

use super::{home_dir, load_config, orchestrator_for};

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Environment name.
    pub env: String,

    /// Write to this env file instead of stdout.
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print a JSON object instead of env-file lines.
    #[arg(long, conflicts_with = "output")]
    pub json: bool,
}

impl PullArgs {
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let home = home_dir()?;
        let cfg = load_config(&home)?;
        let environment = EnvironmentName::from(self.env);
        let orchestrator = orchestrator_for(&home, &cfg, &environment)?;

        let snapshot = orchestrator
            .pull(cancel, &environment)
            .await
            .with_context(|| format!("failed to pull '{environment}'"))?;

        if let Some(path) = self.output {
            env_file::save_snapshot(&path, &snapshot)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "✓ Pulled {} key(s) from '{environment}' into {}",
                snapshot.len(),
                path.display()
            );
        } else if self.json {
            let json = serde_json::to_string_pretty(&snapshot)?;
            println!("{json}");
        } else {
            print!("{}", env_file::render(&snapshot));
        }
        Ok(())
    }
}
