//! # keysync-sync
//!
//! Resilient bulk synchronization of key-value environments.
//!
//! Every remote call goes through the [`RetryEngine`]; groups of calls are
//! dispatched by the [`batch`] executor; repeated reads are served by the
//! [`CoalescingCache`]; and a [`DiffResult`] decides what a push must write.
//! [`SyncOrchestrator`] ties them together per environment.

pub mod batch;
pub mod cache;
pub mod diff;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod remote;
pub mod retry;
pub mod sensitivity;

pub use batch::{
    aggregate, process_batch, process_batch_with_progress, BatchProgress, BatchResult, WorkItem,
};
pub use cache::{cache_key, CacheEntry, CacheMetadata, CoalescingCache};
pub use diff::{diff, DiffResult, ValueChange};
pub use error::{ErrorKind, RemoteError, RetryError, SyncError};
pub use orchestrator::{
    Conflict, ConflictDecision, ConflictResolver, DeleteReport, KeyDecision, PushReport,
    RemoteVariable, SyncOrchestrator,
};
pub use pool::BufferPool;
pub use remote::{Parameter, ParameterStore, ParameterType, SecretEntry, SecretStore};
pub use retry::{RetryEngine, RetryPolicy};
pub use sensitivity::is_sensitive_key;
