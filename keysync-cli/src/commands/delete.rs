//! `keysync delete <env> --yes`

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use keysync_core::EnvironmentName;

use super::{home_dir, load_config, orchestrator_for};

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Environment name.
    pub env: String,

    /// Confirm deletion of every remote key of the environment.
    #[arg(long)]
    pub yes: bool,
}

impl DeleteArgs {
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let environment = EnvironmentName::from(self.env);
        if !self.yes {
            bail!("refusing to delete every key of '{environment}' without --yes");
        }

        let home = home_dir()?;
        let cfg = load_config(&home)?;
        let orchestrator = orchestrator_for(&home, &cfg, &environment)?;
        let report = orchestrator
            .delete_environment(cancel, &environment)
            .await
            .with_context(|| format!("failed to delete '{environment}'"))?;

        println!("✓ Deleted {} key(s) from '{environment}'", report.deleted);
        Ok(())
    }
}
