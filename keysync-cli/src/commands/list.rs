//! `keysync list <env> [--json]`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;

use keysync_core::EnvironmentName;
use keysync_sync::RemoteVariable;

use super::{home_dir, load_config, orchestrator_for};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Environment name.
    pub env: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListArgs {
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let home = home_dir()?;
        let cfg = load_config(&home)?;
        let environment = EnvironmentName::from(self.env);
        let orchestrator = orchestrator_for(&home, &cfg, &environment)?;

        let variables = orchestrator
            .list_environment_variables(cancel, &environment)
            .await
            .with_context(|| format!("failed to list '{environment}'"))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&variables)?);
            return Ok(());
        }
        print_table(&environment, variables);
        Ok(())
    }
}

#[derive(Tabled)]
struct VariableRow {
    #[tabled(rename = "key")]
    key: String,
    #[tabled(rename = "sensitive")]
    sensitive: String,
}

fn print_table(environment: &EnvironmentName, variables: Vec<RemoteVariable>) {
    if variables.is_empty() {
        println!("No keys stored for '{environment}'.");
        return;
    }
    let count = variables.len();
    let sensitive = variables.iter().filter(|v| v.sensitive).count();
    let rows: Vec<VariableRow> = variables
        .into_iter()
        .map(|v| VariableRow {
            key: v.key,
            sensitive: if v.sensitive { "yes".to_string() } else { String::new() },
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!(
        "{} key(s), {} sensitive",
        count.to_string().bold(),
        sensitive.to_string().yellow()
    );
}
