pub mod delete;
pub mod diff;
pub mod env;
pub mod init;
pub mod list;
pub mod progress;
pub mod pull;
pub mod push;
pub mod resolver;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use keysync_core::{config, env_file, BackendResolver, Config, EnvironmentName, KeyValueSnapshot};
use keysync_sync::remote::{FileParameterStore, FileSecretStore};
use keysync_sync::SyncOrchestrator;

/// Env file used when neither `-f` nor the environment's `files` name one.
const DEFAULT_ENV_FILE: &str = ".env";

pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub fn load_config(home: &Path) -> Result<Config> {
    config::load_at(home).context("failed to load keysync config")
}

/// Orchestrator for `environment`, talking to the file-backed remote of the
/// environment's region.
pub fn orchestrator_for(
    home: &Path,
    cfg: &Config,
    environment: &EnvironmentName,
) -> Result<SyncOrchestrator> {
    let backend = cfg
        .resolve_backend(environment)
        .with_context(|| format!("cannot resolve environment '{environment}'"))?;
    tracing::debug!(
        environment = %environment,
        backend = %backend.kind,
        region = %backend.region,
        "resolved backend",
    );

    Ok(SyncOrchestrator::new(
        Arc::new(cfg.clone()),
        Arc::new(FileParameterStore::at(home, &backend.region)),
        Arc::new(FileSecretStore::at(home, &backend.region)),
        &cfg.sync,
    ))
}

/// Merge the local env files for `environment`: `files` if given, else the
/// environment's configured files, else `.env`.
pub fn local_snapshot(
    cfg: &Config,
    environment: &EnvironmentName,
    files: &[PathBuf],
) -> Result<KeyValueSnapshot> {
    let paths: Vec<PathBuf> = if !files.is_empty() {
        files.to_vec()
    } else {
        let configured = &cfg.environment(environment)?.files;
        if configured.is_empty() {
            vec![PathBuf::from(DEFAULT_ENV_FILE)]
        } else {
            configured.iter().map(PathBuf::from).collect()
        }
    };
    env_file::load_snapshot(&paths).context("failed to read local env files")
}
