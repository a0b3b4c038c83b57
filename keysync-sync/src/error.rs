//! Error types for keysync-sync.
//!
//! Remote failures are classified exactly once, at the boundary where a
//! remote-store error is received ([`RemoteError::classify`]). The resulting
//! [`ErrorKind`] drives retry decisions and the hint shown to the user.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use keysync_core::{ConfigError, EnvFileError};

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    AlreadyExists,
    RateLimited,
    Timeout,
    Generic,
}

impl ErrorKind {
    /// Transient failures eligible for automatic retry.
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Timeout)
    }

    /// The fixed, user-facing hint for this kind of failure.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "check the environment name and remote path",
            ErrorKind::AccessDenied => "check credentials and permissions",
            ErrorKind::AlreadyExists => "re-run with --overwrite or choose a conflict strategy",
            ErrorKind::RateLimited => "reduce --workers or --batch-size and retry",
            ErrorKind::Timeout => "check network connectivity or raise the retry timeout",
            ErrorKind::Generic => "re-run with --verbose for details",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Generic => "remote error",
        };
        f.write_str(label)
    }
}

/// A classified error returned by a remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    /// Classify a service error code (as returned by the remote API) into an
    /// [`ErrorKind`]. Unknown codes are `Generic`.
    pub fn classify(code: &str, message: impl Into<String>) -> Self {
        let kind = match code {
            "ParameterNotFound" | "ResourceNotFoundException" | "NotFound" => {
                ErrorKind::NotFound
            }
            "AccessDeniedException" | "AccessDenied" | "UnauthorizedOperation"
            | "ExpiredTokenException" => ErrorKind::AccessDenied,
            "ParameterAlreadyExists" | "ResourceExistsException" => ErrorKind::AlreadyExists,
            "ThrottlingException" | "TooManyUpdates" | "Throttling" | "RequestLimitExceeded" => {
                ErrorKind::RateLimited
            }
            "RequestTimeout" | "RequestTimeoutException" | "TimeoutError" => ErrorKind::Timeout,
            _ => ErrorKind::Generic,
        };
        Self::new(kind, message)
    }
}

/// Why a retry-wrapped operation gave up.
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    /// The error was classified as not retriable. `attempts` counts the
    /// retriable failures before it as well.
    #[error("{error}")]
    Permanent { attempts: u32, error: RemoteError },

    /// Every allowed attempt failed with a retriable error.
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// The overall retry deadline passed.
    #[error("operation timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout { attempts: u32, elapsed: Duration },

    /// The caller's cancellation token fired.
    #[error("operation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryError::Permanent { error: err, .. } | RetryError::Exhausted { source: err, .. } => {
                err.kind
            }
            RetryError::Timeout { .. } => ErrorKind::Timeout,
            RetryError::Cancelled { .. } => ErrorKind::Generic,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Timeout { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the configuration layer.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An error reading or writing local env files.
    #[error("env file error: {0}")]
    EnvFile(#[from] EnvFileError),

    /// A remote operation on `key` failed after retry handling.
    #[error("{key}: {source}")]
    Remote {
        key: String,
        #[source]
        source: RetryError,
    },

    /// A document-store payload could not be encoded or decoded.
    #[error("invalid document for '{name}': {source}")]
    Document {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// More than one item of a batch failed. `first` is representative;
    /// `keys` lists every failed item.
    #[error("{failed} of {total} operations failed (first error: {first})")]
    PartialFailure {
        failed: usize,
        total: usize,
        keys: Vec<String>,
        first: Box<SyncError>,
    },

    /// The conflict resolver cancelled the push. The listed keys were not
    /// written; keys without conflicts may already have been, when the
    /// conflict only surfaced at write time.
    #[error("push aborted: {} conflicting key(s) left unresolved", .conflicts.len())]
    Aborted { conflicts: Vec<String> },

    /// The caller's cancellation token fired before the work completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker task panicked or was torn down.
    #[error("worker failed: {0}")]
    Worker(String),

    /// An error produced once and handed to several waiters.
    #[error(transparent)]
    Shared(Arc<SyncError>),
}

impl SyncError {
    /// The remote classification behind this error, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SyncError::Remote { source, .. } => Some(source.kind()),
            SyncError::PartialFailure { first, .. } => first.kind(),
            SyncError::Shared(inner) => inner.kind(),
            _ => None,
        }
    }

    /// User-facing hint for classified remote failures.
    pub fn hint(&self) -> Option<&'static str> {
        self.kind().map(ErrorKind::hint)
    }

    pub(crate) fn remote(key: impl Into<String>, source: RetryError) -> Self {
        SyncError::Remote {
            key: key.into(),
            source,
        }
    }
}

impl From<Arc<SyncError>> for SyncError {
    fn from(shared: Arc<SyncError>) -> Self {
        match Arc::try_unwrap(shared) {
            Ok(owned) => owned,
            Err(shared) => SyncError::Shared(shared),
        }
    }
}
