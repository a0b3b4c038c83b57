//! Error types for keysync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with the path that was being accessed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`, so `~/.keysync/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}; run `keysync init` first")]
    NotFound { path: PathBuf },

    /// No environment with this name is configured.
    #[error("environment '{name}' is not configured")]
    EnvironmentNotFound { name: String },

    /// The config parsed but violates a structural rule.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors from reading or writing local env files.
#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

pub(crate) fn config_io(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn env_io(path: impl Into<PathBuf>, source: std::io::Error) -> EnvFileError {
    EnvFileError::Io {
        path: path.into(),
        source,
    }
}
