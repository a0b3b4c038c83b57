//! YAML configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.keysync/
//!   config.yaml     (mode 0600, created by `keysync init`)
//!   remote/         (file-backed remote emulation, see keysync-sync)
//! ```
//!
//! # API pattern
//!
//! Every filesystem function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{config_io, ConfigError};
use crate::types::{Config, Environment, EnvironmentName, ResolvedBackend, SyncSettings};

/// Current on-disk schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Region used when `init` scaffolds a fresh config.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Maps an environment name to the remote backend that stores it.
pub trait BackendResolver: Send + Sync {
    fn resolve_backend(&self, environment: &EnvironmentName)
        -> Result<ResolvedBackend, ConfigError>;
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.keysync/`
pub fn keysync_root(home: &Path) -> PathBuf {
    home.join(".keysync")
}

/// `<home>/.keysync/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    keysync_root(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.keysync/config.yaml`.
///
/// Returns `ConfigError::NotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| config_io(&path, e))?;
    let config: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config to `<home>/.keysync/config.yaml`.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    let root = keysync_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| config_io(&root, e))?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| config_io(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| config_io(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &Config) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Scaffold a config with no environments.
///
/// Idempotent: if the file already exists, loads and returns it unchanged.
pub fn init_at(home: &Path, region: Option<String>) -> Result<Config, ConfigError> {
    if config_path_at(home).exists() {
        return load_at(home);
    }
    let now = Utc::now();
    let config = Config {
        version: CONFIG_VERSION,
        region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        sync: SyncSettings::default(),
        environments: vec![],
        created_at: now,
        updated_at: now,
    };
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(region: Option<String>) -> Result<Config, ConfigError> {
    init_at(&home()?, region)
}

// ---------------------------------------------------------------------------
// 5. Queries
// ---------------------------------------------------------------------------

impl Config {
    /// Look up an environment by name.
    pub fn environment(&self, name: &EnvironmentName) -> Result<&Environment, ConfigError> {
        self.environments
            .iter()
            .find(|env| env.name == *name)
            .ok_or_else(|| ConfigError::EnvironmentNotFound {
                name: name.0.clone(),
            })
    }

    /// Add or replace an environment, bumping `updated_at`.
    pub fn upsert_environment(&mut self, environment: Environment) {
        match self
            .environments
            .iter_mut()
            .find(|env| env.name == environment.name)
        {
            Some(existing) => *existing = environment,
            None => self.environments.push(environment),
        }
        self.updated_at = Utc::now();
    }

    /// Remove an environment by name, returning it if it was configured.
    pub fn remove_environment(&mut self, name: &EnvironmentName) -> Option<Environment> {
        let index = self.environments.iter().position(|env| env.name == *name)?;
        self.updated_at = Utc::now();
        Some(self.environments.remove(index))
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be at least 1".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.batch_size must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.name.0.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "environment '{}' is defined more than once",
                    env.name
                )));
            }
            if env.path.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "environment '{}' has an empty path",
                    env.name
                )));
            }
        }
        Ok(())
    }
}

impl BackendResolver for Config {
    fn resolve_backend(
        &self,
        environment: &EnvironmentName,
    ) -> Result<ResolvedBackend, ConfigError> {
        let env = self.environment(environment)?;
        Ok(ResolvedBackend {
            kind: env.backend,
            base_path: env.path.clone(),
            region: env.region.clone().unwrap_or_else(|| self.region.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| config_io(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| config_io(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn env(name: &str, backend: BackendKind, path: &str) -> Environment {
        Environment {
            name: EnvironmentName::from(name),
            backend,
            path: path.to_string(),
            region: None,
            files: vec![],
        }
    }

    #[test]
    fn config_path_is_correct() {
        let home = make_home();
        assert!(config_path_at(home.path()).ends_with(".keysync/config.yaml"));
    }

    #[test]
    fn init_is_idempotent() {
        let home = make_home();
        let first = init_at(home.path(), Some("eu-west-1".into())).expect("init");
        let second = init_at(home.path(), None).expect("init again");
        assert_eq!(first.region, "eu-west-1");
        assert_eq!(second.region, "eu-west-1");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = make_home();
        let mut config = init_at(home.path(), None).expect("init");
        config.upsert_environment(env("dev", BackendKind::ParameterStore, "/app/dev"));
        save_at(home.path(), &config).expect("save");
        let loaded = load_at(home.path()).expect("load");
        assert_eq!(loaded.environments, config.environments);
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        init_at(home.path(), None).expect("init");
        let tmp = config_path_at(home.path()).with_file_name("config.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn resolve_backend_falls_back_to_global_region() {
        let home = make_home();
        let mut config = init_at(home.path(), Some("us-west-2".into())).expect("init");
        config.upsert_environment(env("prod", BackendKind::SecretsManager, "app/prod"));
        let mut staging = env("staging", BackendKind::ParameterStore, "/app/staging");
        staging.region = Some("ap-south-1".into());
        config.upsert_environment(staging);

        let prod = config
            .resolve_backend(&EnvironmentName::from("prod"))
            .expect("prod");
        assert_eq!(prod.kind, BackendKind::SecretsManager);
        assert_eq!(prod.region, "us-west-2");

        let staging = config
            .resolve_backend(&EnvironmentName::from("staging"))
            .expect("staging");
        assert_eq!(staging.region, "ap-south-1");
        assert_eq!(staging.base_path, "/app/staging");
    }

    #[test]
    fn unknown_environment_is_reported_by_name() {
        let home = make_home();
        let config = init_at(home.path(), None).expect("init");
        let err = config
            .resolve_backend(&EnvironmentName::from("qa"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvironmentNotFound { .. }));
        assert!(err.to_string().contains("'qa'"));
    }

    #[test]
    fn remove_environment_returns_removed_entry() {
        let home = make_home();
        let mut config = init_at(home.path(), None).expect("init");
        config.upsert_environment(env("dev", BackendKind::ParameterStore, "/app/dev"));

        let removed = config.remove_environment(&EnvironmentName::from("dev"));
        assert_eq!(removed.map(|e| e.path), Some("/app/dev".to_string()));
        assert!(config
            .remove_environment(&EnvironmentName::from("dev"))
            .is_none());
    }

    #[test]
    fn duplicate_environment_names_are_rejected() {
        let home = make_home();
        let mut config = init_at(home.path(), None).expect("init");
        config
            .environments
            .push(env("dev", BackendKind::ParameterStore, "/a"));
        config
            .environments
            .push(env("dev", BackendKind::ParameterStore, "/b"));
        let err = save_at(home.path(), &config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
