//! `keysync init [--region <region>]`

use anyhow::{Context, Result};
use clap::Args;

use keysync_core::config;

use super::home_dir;

/// Create the keysync config if it does not exist yet.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Default region for environments that do not set their own.
    #[arg(long)]
    pub region: Option<String>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let existed = config::config_path_at(&home).exists();
        let cfg = config::init_at(&home, self.region).context("failed to initialise keysync")?;

        if existed {
            println!("✓ Config already present (region {})", cfg.region);
        } else {
            println!("✓ Initialised keysync (region {})", cfg.region);
        }
        println!("  Config: {}", config::config_path_at(&home).display());
        if cfg.environments.is_empty() {
            println!("  Next: keysync env add <name> --path <path>");
        }
        Ok(())
    }
}
