//! `keysync env add|list|remove`

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use keysync_core::{config, BackendKind, Environment, EnvironmentName};

use super::{home_dir, load_config};

/// Manage configured environments.
#[derive(Subcommand, Debug)]
pub enum EnvCommand {
    /// Add an environment, or replace one with the same name.
    Add(AddArgs),

    /// List configured environments.
    List,

    /// Remove an environment from the config. Remote data is left alone.
    Remove {
        /// Environment name.
        name: String,
    },
}

/// Thin wrapper so clap can parse `BackendKind`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendArg(pub BackendKind);

impl FromStr for BackendArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "parameter_store" | "ssm" => Ok(Self(BackendKind::ParameterStore)),
            "secrets_manager" | "secrets" => Ok(Self(BackendKind::SecretsManager)),
            other => Err(format!(
                "unknown backend '{other}'; expected: parameter_store, secrets_manager"
            )),
        }
    }
}

impl fmt::Display for BackendArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Environment name (e.g. "dev", "prod").
    pub name: String,

    /// Base path (parameter store) or secret name (secrets manager).
    #[arg(long)]
    pub path: String,

    /// parameter_store | secrets_manager. Defaults to parameter_store.
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<BackendArg>,

    /// Region override for this environment.
    #[arg(long)]
    pub region: Option<String>,

    /// Default local env files, merged in order.
    #[arg(long = "file", short = 'f', value_name = "FILE")]
    pub files: Vec<String>,
}

pub fn run(cmd: EnvCommand) -> Result<()> {
    match cmd {
        EnvCommand::Add(args) => add(args),
        EnvCommand::List => list(),
        EnvCommand::Remove { name } => remove(name),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let home = home_dir()?;
    let mut cfg = load_config(&home)?;
    let environment = Environment {
        name: EnvironmentName::from(args.name),
        backend: args.backend.unwrap_or_default().0,
        path: args.path,
        region: args.region,
        files: args.files,
    };
    let summary = format!(
        "'{}' → {} {}",
        environment.name, environment.backend, environment.path
    );
    cfg.upsert_environment(environment);
    config::save_at(&home, &cfg).context("failed to save keysync config")?;

    println!("✓ Saved environment {summary}");
    Ok(())
}

#[derive(Tabled)]
struct EnvRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "backend")]
    backend: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "region")]
    region: String,
    #[tabled(rename = "files")]
    files: String,
}

fn list() -> Result<()> {
    let home = home_dir()?;
    let cfg = load_config(&home)?;

    if cfg.environments.is_empty() {
        println!("No environments configured.");
        println!("Run: keysync env add <name> --path <path>");
        return Ok(());
    }

    let rows: Vec<EnvRow> = cfg
        .environments
        .iter()
        .map(|env| EnvRow {
            name: env.name.to_string(),
            backend: env.backend.to_string(),
            path: env.path.clone(),
            region: env.region.clone().unwrap_or_else(|| cfg.region.clone()),
            files: env.files.join(", "),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn remove(name: String) -> Result<()> {
    let home = home_dir()?;
    let mut cfg = load_config(&home)?;
    let name = EnvironmentName::from(name);
    if cfg.remove_environment(&name).is_none() {
        bail!("environment '{name}' is not configured");
    }
    config::save_at(&home, &cfg).context("failed to save keysync config")?;
    println!("✓ Removed environment '{name}'");
    Ok(())
}
