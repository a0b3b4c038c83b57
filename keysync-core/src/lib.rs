//! keysync core library: domain types, configuration, env files, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, [`KeyValueSnapshot`], backend descriptions
//! - [`config`]: YAML configuration load / save / init and backend resolution
//! - [`env_file`]: local `.env` snapshot load / save
//! - [`error`]: [`ConfigError`], [`EnvFileError`]

pub mod config;
pub mod env_file;
pub mod error;
pub mod types;

pub use config::BackendResolver;
pub use error::{ConfigError, EnvFileError};
pub use types::{
    BackendKind, Config, Environment, EnvironmentName, KeyValueSnapshot, ResolvedBackend,
    RetrySettings, RetryStrategyKind, SyncSettings,
};
