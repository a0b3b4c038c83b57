//! Environment-level operations against the remote stores.
//!
//! [`SyncOrchestrator`] resolves each environment to a backend and then:
//!
//! - **push**: diffs the local snapshot against the cached remote snapshot,
//!   asks the [`ConflictResolver`] about keys whose remote value differs,
//!   and writes the rest. Parameter-store writes are one retry-wrapped work
//!   item per key, dispatched in `batch_size` chunks over `workers` tasks.
//!   Document-store writes merge into the existing document and go out as a
//!   single retry-wrapped update.
//! - **pull**: served from the coalescing cache; a miss lists the prefix and
//!   fetches every value through the batch executor.
//! - **list / delete / diff**: built on the same listing and snapshot paths.
//!
//! Values are never logged; only key names and counts.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use keysync_core::{
    BackendKind, BackendResolver, EnvironmentName, KeyValueSnapshot, ResolvedBackend,
    SyncSettings,
};

use crate::batch::{
    aggregate, process_batch, process_batch_with_progress, BatchProgress, BatchResult, WorkItem,
};
use crate::cache::{cache_key, CacheMetadata, CoalescingCache, SENSITIVE_TAG};
use crate::diff::DiffResult;
use crate::error::{ErrorKind, SyncError};
use crate::pool::BufferPool;
use crate::remote::{join_name, relative_name, Parameter, ParameterStore, ParameterType, SecretStore};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::sensitivity::{is_sensitive_key, parameter_type_for};

/// How long a parameter-store snapshot is served from cache.
pub const PARAMETER_SNAPSHOT_TTL: Duration = Duration::from_secs(15 * 60);
/// How long a document-store snapshot is served from cache.
pub const DOCUMENT_SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);

const SNAPSHOT_NAMESPACE: &str = "remote_snapshot";

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

/// A key present on both sides with different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: String,
    pub remote: String,
    pub local: String,
}

/// Answer for a whole set of conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    OverwriteAll,
    SkipAll,
    /// Ask [`ConflictResolver::confirm`] for each key.
    PerKey,
    /// Abort the push before anything is written.
    Cancel,
}

/// Answer for one conflicting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDecision {
    Overwrite,
    Skip,
    Cancel,
}

/// Decides what happens to keys the remote already holds with other values.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn decide(
        &self,
        environment: &EnvironmentName,
        conflicts: &[Conflict],
    ) -> ConflictDecision;

    async fn confirm(&self, _conflict: &Conflict) -> KeyDecision {
        KeyDecision::Skip
    }
}

/// A fixed answer, whatever the conflicts are.
#[async_trait]
impl ConflictResolver for ConflictDecision {
    async fn decide(
        &self,
        _environment: &EnvironmentName,
        _conflicts: &[Conflict],
    ) -> ConflictDecision {
        *self
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Keys written to the remote.
    pub pushed: usize,
    /// Conflicting keys left untouched by decision.
    pub skipped: usize,
    /// Keys whose remote value already matched.
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
}

/// A remote key as shown by `list`; values are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteVariable {
    pub key: String,
    pub sensitive: bool,
}

// ---------------------------------------------------------------------------
// Push state tracing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushState {
    ResolvingBackend,
    CheckingConflicts,
    AwaitingDecision,
    Dispatching,
    AwaitingBatch,
    Aggregating,
    Done,
    Failed,
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn enter(environment: &EnvironmentName, state: PushState) {
    tracing::debug!(environment = %environment, state = %state, "push state");
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share the cache, stores, and retry engine.
#[derive(Clone)]
pub struct SyncOrchestrator {
    resolver: Arc<dyn BackendResolver>,
    parameters: Arc<dyn ParameterStore>,
    secrets: Arc<dyn SecretStore>,
    retry: Arc<RetryEngine>,
    cache: CoalescingCache<KeyValueSnapshot, SyncError>,
    conflicts: Arc<dyn ConflictResolver>,
    progress: Option<UnboundedSender<BatchProgress>>,
    buffers: BufferPool,
    workers: usize,
    batch_size: usize,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("workers", &self.workers)
            .field("batch_size", &self.batch_size)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Orchestrator using `settings` for concurrency and retries. Conflicts
    /// abort the push until a resolver is supplied.
    pub fn new(
        resolver: Arc<dyn BackendResolver>,
        parameters: Arc<dyn ParameterStore>,
        secrets: Arc<dyn SecretStore>,
        settings: &SyncSettings,
    ) -> Self {
        SyncOrchestrator {
            resolver,
            parameters,
            secrets,
            retry: Arc::new(RetryEngine::new(RetryPolicy::from(&settings.retry))),
            cache: CoalescingCache::new(),
            conflicts: Arc::new(ConflictDecision::Cancel),
            progress: None,
            buffers: BufferPool::default(),
            workers: settings.workers.max(1),
            batch_size: settings.batch_size.max(1),
        }
    }

    pub fn with_retry_engine(mut self, engine: RetryEngine) -> Self {
        self.retry = Arc::new(engine);
        self
    }

    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflicts = resolver;
        self
    }

    /// Receive one event per completed remote write or read.
    pub fn with_progress(mut self, progress: UnboundedSender<BatchProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_buffer_pool(mut self, buffers: BufferPool) -> Self {
        self.buffers = buffers;
        self
    }

    /// Share a snapshot cache with other orchestrators.
    pub fn with_cache(mut self, cache: CoalescingCache<KeyValueSnapshot, SyncError>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn cache(&self) -> &CoalescingCache<KeyValueSnapshot, SyncError> {
        &self.cache
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Write `local` to the environment's remote.
    ///
    /// With `overwrite == false`, keys already present remotely with a
    /// different value go through the conflict resolver first.
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        local: &KeyValueSnapshot,
        overwrite: bool,
    ) -> Result<PushReport, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        enter(environment, PushState::ResolvingBackend);
        let outcome = self.push_inner(cancel, environment, local, overwrite).await;
        match &outcome {
            Ok(report) => {
                enter(environment, PushState::Done);
                tracing::info!(
                    environment = %environment,
                    pushed = report.pushed,
                    skipped = report.skipped,
                    unchanged = report.unchanged,
                    "push complete",
                );
            }
            Err(err) => {
                enter(environment, PushState::Failed);
                tracing::debug!(environment = %environment, error = %err, "push failed");
            }
        }
        outcome
    }

    /// The environment's remote contents, from cache when fresh.
    pub async fn pull(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
    ) -> Result<KeyValueSnapshot, SyncError> {
        let backend = self.resolver.resolve_backend(environment)?;
        let snapshot = self.remote_snapshot(cancel, environment, &backend).await?;
        tracing::info!(environment = %environment, keys = snapshot.len(), "pulled environment");
        Ok(snapshot)
    }

    /// Remote key names and whether each holds a sensitive value.
    pub async fn list_environment_variables(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
    ) -> Result<Vec<RemoteVariable>, SyncError> {
        let backend = self.resolver.resolve_backend(environment)?;
        let variables = match backend.kind {
            BackendKind::ParameterStore => self
                .list_parameters(cancel, &backend.base_path, false)
                .await?
                .into_iter()
                .filter_map(|param| {
                    let key = relative_name(&backend.base_path, &param.name)?.to_string();
                    let sensitive =
                        param.kind == ParameterType::SecureString || is_sensitive_key(&key);
                    Some(RemoteVariable { key, sensitive })
                })
                .collect(),
            BackendKind::SecretsManager => self
                .remote_snapshot(cancel, environment, &backend)
                .await?
                .keys()
                .map(|key| RemoteVariable {
                    key: key.to_string(),
                    sensitive: is_sensitive_key(key),
                })
                .collect(),
        };
        Ok(variables)
    }

    /// Remove every remote key of the environment.
    ///
    /// Deletes run one after another; a failure is recorded and the rest
    /// still run.
    pub async fn delete_environment(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
    ) -> Result<DeleteReport, SyncError> {
        let backend = self.resolver.resolve_backend(environment)?;
        let names: Vec<String> = match backend.kind {
            BackendKind::ParameterStore => self
                .list_parameters(cancel, &backend.base_path, false)
                .await?
                .into_iter()
                .map(|param| param.name)
                .collect(),
            BackendKind::SecretsManager => self.list_secrets(cancel, &backend.base_path).await?,
        };

        let total = names.len();
        tracing::info!(environment = %environment, total, "deleting environment");
        let mut results = Vec::with_capacity(total);
        for name in names {
            if cancel.is_cancelled() {
                break;
            }
            let result = match backend.kind {
                BackendKind::ParameterStore => self.delete_parameter(cancel, &name).await,
                BackendKind::SecretsManager => self.delete_secret(cancel, &name).await,
            };
            results.push(BatchResult { id: name, result });
        }
        self.invalidate(environment, &backend);

        let attempted = results.len();
        let deleted = aggregate(results)?;
        if attempted < total {
            return Err(SyncError::Cancelled);
        }
        Ok(DeleteReport { deleted })
    }

    /// Compare the remote contents (old) with `local` (new).
    pub async fn diff(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        local: &KeyValueSnapshot,
    ) -> Result<DiffResult, SyncError> {
        let backend = self.resolver.resolve_backend(environment)?;
        let remote = self.remote_snapshot(cancel, environment, &backend).await?;
        Ok(crate::diff::diff(&remote, local))
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    async fn push_inner(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        local: &KeyValueSnapshot,
        overwrite: bool,
    ) -> Result<PushReport, SyncError> {
        let backend = self.resolver.resolve_backend(environment)?;
        tracing::info!(
            environment = %environment,
            backend = %backend.kind,
            region = %backend.region,
            keys = local.len(),
            overwrite,
            "pushing environment",
        );
        match backend.kind {
            BackendKind::ParameterStore => {
                self.push_parameters(cancel, environment, &backend, local, overwrite)
                    .await
            }
            BackendKind::SecretsManager => {
                self.push_document(cancel, environment, &backend, local, overwrite)
                    .await
            }
        }
    }

    async fn push_parameters(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        backend: &ResolvedBackend,
        local: &KeyValueSnapshot,
        overwrite: bool,
    ) -> Result<PushReport, SyncError> {
        let mut report = PushReport::default();

        // (key, value, overwrite flag for the put)
        let plan: Vec<(String, String, bool)> = if overwrite {
            local
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string(), true))
                .collect()
        } else {
            enter(environment, PushState::CheckingConflicts);
            let remote = self.remote_snapshot(cancel, environment, backend).await?;
            let delta = crate::diff::diff(&remote, local);
            let overwrites = self.resolve_conflicts(environment, &delta).await?;
            report.unchanged = delta.unchanged;
            report.skipped = delta.modified.len() - overwrites.len();
            delta
                .added
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string(), false))
                .chain(overwrites.into_iter().map(|(key, value)| (key, value, true)))
                .collect()
        };

        if plan.is_empty() {
            return Ok(report);
        }

        enter(environment, PushState::Dispatching);
        let total = plan.len();
        let items = plan
            .into_iter()
            .map(|(key, value, overwrite)| {
                self.put_item(cancel, &backend.base_path, key, value, overwrite)
            })
            .collect();

        enter(environment, PushState::AwaitingBatch);
        let results = self.dispatch(cancel, items).await;
        self.invalidate(environment, backend);

        let attempted = results.len();
        let (raced, mut results): (Vec<_>, Vec<_>) =
            results.into_iter().partition(|r| !overwrite && already_exists(r));
        if !raced.is_empty() {
            if cancel.is_cancelled() {
                results.extend(raced);
            } else {
                let late = self
                    .push_raced_keys(cancel, environment, backend, local, raced, &mut report)
                    .await?;
                results.extend(late);
            }
        }

        enter(environment, PushState::Aggregating);
        report.pushed = aggregate(results)?;
        if attempted < total {
            return Err(SyncError::Cancelled);
        }
        Ok(report)
    }

    /// Keys that were absent from the snapshot but already existed when
    /// written. They are checked against a fresh read and go through the
    /// conflict resolver like any other conflict.
    async fn push_raced_keys(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        backend: &ResolvedBackend,
        local: &KeyValueSnapshot,
        raced: Vec<BatchResult>,
        report: &mut PushReport,
    ) -> Result<Vec<BatchResult>, SyncError> {
        tracing::info!(
            environment = %environment,
            keys = raced.len(),
            "keys appeared remotely during push",
        );
        enter(environment, PushState::CheckingConflicts);
        let remote = self.remote_snapshot(cancel, environment, backend).await?;

        let mut conflicts = Vec::new();
        let mut writes = Vec::new();
        for key in raced.into_iter().map(|r| r.id) {
            let Some(value) = local.get(&key) else {
                continue;
            };
            match remote.get(&key) {
                Some(current) if current == value => report.unchanged += 1,
                Some(current) => conflicts.push(Conflict {
                    remote: current.to_string(),
                    local: value.to_string(),
                    key,
                }),
                None => writes.push((key, value.to_string())),
            }
        }

        let conflicting = conflicts.len();
        let chosen = self.resolve(environment, conflicts).await?;
        report.skipped += conflicting - chosen.len();
        writes.extend(chosen);
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        enter(environment, PushState::Dispatching);
        let expected = writes.len();
        let items = writes
            .into_iter()
            .map(|(key, value)| self.put_item(cancel, &backend.base_path, key, value, true))
            .collect();

        enter(environment, PushState::AwaitingBatch);
        let results = self.dispatch(cancel, items).await;
        self.invalidate(environment, backend);
        if results.len() < expected {
            return Err(SyncError::Cancelled);
        }
        Ok(results)
    }

    async fn push_document(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        backend: &ResolvedBackend,
        local: &KeyValueSnapshot,
        overwrite: bool,
    ) -> Result<PushReport, SyncError> {
        if !overwrite {
            enter(environment, PushState::CheckingConflicts);
        }
        let remote = self.remote_snapshot(cancel, environment, backend).await?;
        let delta = crate::diff::diff(&remote, local);

        let overwrites = if overwrite {
            delta
                .modified
                .iter()
                .map(|(key, change)| (key.clone(), change.new.clone()))
                .collect()
        } else {
            self.resolve_conflicts(environment, &delta).await?
        };

        let report = PushReport {
            pushed: delta.added.len() + overwrites.len(),
            skipped: delta.modified.len() - overwrites.len(),
            unchanged: delta.unchanged,
        };
        if report.pushed == 0 {
            return Ok(report);
        }

        // Remote-only keys stay in the document.
        let mut merged = remote;
        merged.merge(&delta.added);
        merged.extend(overwrites);
        let document = self.encode_document(&backend.base_path, &merged)?;

        enter(environment, PushState::Dispatching);
        let item = self.document_item(cancel, environment, &backend.base_path, document);

        enter(environment, PushState::AwaitingBatch);
        let results = self.dispatch(cancel, vec![item]).await;
        self.invalidate(environment, backend);

        enter(environment, PushState::Aggregating);
        if results.is_empty() {
            return Err(SyncError::Cancelled);
        }
        aggregate(results)?;
        Ok(report)
    }

    /// Keys (with their local value) the resolver chose to overwrite.
    async fn resolve_conflicts(
        &self,
        environment: &EnvironmentName,
        delta: &DiffResult,
    ) -> Result<Vec<(String, String)>, SyncError> {
        let conflicts: Vec<Conflict> = delta
            .modified
            .iter()
            .map(|(key, change)| Conflict {
                key: key.clone(),
                remote: change.old.clone(),
                local: change.new.clone(),
            })
            .collect();
        self.resolve(environment, conflicts).await
    }

    async fn resolve(
        &self,
        environment: &EnvironmentName,
        conflicts: Vec<Conflict>,
    ) -> Result<Vec<(String, String)>, SyncError> {
        if conflicts.is_empty() {
            return Ok(Vec::new());
        }

        enter(environment, PushState::AwaitingDecision);
        tracing::info!(
            environment = %environment,
            conflicts = conflicts.len(),
            "remote already holds different values",
        );

        let chosen = match self.conflicts.decide(environment, &conflicts).await {
            ConflictDecision::OverwriteAll => conflicts,
            ConflictDecision::SkipAll => Vec::new(),
            ConflictDecision::Cancel => return Err(aborted(&conflicts)),
            ConflictDecision::PerKey => {
                let mut chosen = Vec::new();
                for conflict in &conflicts {
                    match self.conflicts.confirm(conflict).await {
                        KeyDecision::Overwrite => chosen.push(conflict.clone()),
                        KeyDecision::Skip => {}
                        KeyDecision::Cancel => return Err(aborted(&conflicts)),
                    }
                }
                chosen
            }
        };
        Ok(chosen.into_iter().map(|c| (c.key, c.local)).collect())
    }

    fn put_item(
        &self,
        cancel: &CancellationToken,
        base_path: &str,
        key: String,
        value: String,
        overwrite: bool,
    ) -> WorkItem {
        let name = join_name(base_path, &key);
        let kind = parameter_type_for(&key);
        let store = self.parameters.clone();
        let retry = self.retry.clone();
        let cancel = cancel.clone();
        WorkItem::new(key.clone(), move || async move {
            retry
                .execute(&cancel, |_| {
                    let store = store.clone();
                    let name = name.clone();
                    let value = value.clone();
                    async move { store.put(&name, &value, kind, overwrite).await }
                })
                .await
                .map_err(|err| SyncError::remote(key, err))
        })
    }

    fn document_item(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        name: &str,
        document: String,
    ) -> WorkItem {
        let name = name.to_string();
        let description = format!("keysync environment {environment}");
        let store = self.secrets.clone();
        let retry = self.retry.clone();
        let cancel = cancel.clone();
        WorkItem::new(name.clone(), move || async move {
            retry
                .execute(&cancel, |_| {
                    let store = store.clone();
                    let name = name.clone();
                    let description = description.clone();
                    let document = document.clone();
                    async move {
                        store
                            .create_or_update(&name, &description, &document)
                            .await
                    }
                })
                .await
                .map_err(|err| SyncError::remote(name, err))
        })
    }

    fn encode_document(&self, name: &str, snapshot: &KeyValueSnapshot) -> Result<String, SyncError> {
        let mut buf = self.buffers.acquire();
        serde_json::to_writer(&mut *buf, snapshot).map_err(|source| SyncError::Document {
            name: name.to_string(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // -----------------------------------------------------------------------
    // Remote reads
    // -----------------------------------------------------------------------

    async fn remote_snapshot(
        &self,
        cancel: &CancellationToken,
        environment: &EnvironmentName,
        backend: &ResolvedBackend,
    ) -> Result<KeyValueSnapshot, SyncError> {
        let key = snapshot_key(environment, backend);
        let ttl = match backend.kind {
            BackendKind::ParameterStore => PARAMETER_SNAPSHOT_TTL,
            BackendKind::SecretsManager => DOCUMENT_SNAPSHOT_TTL,
        };
        let metadata: CacheMetadata = [
            ("environment".to_string(), environment.to_string()),
            ("backend".to_string(), backend.kind.to_string()),
            (SENSITIVE_TAG.to_string(), "true".to_string()),
        ]
        .into_iter()
        .collect();

        // The fetch is shared by every concurrent caller, so it runs under
        // its own token and reports no progress. Each caller still stops
        // waiting when its own token fires; the fetch is dropped once nobody
        // is waiting for it.
        let this = SyncOrchestrator {
            progress: None,
            ..self.clone()
        };
        let backend = backend.clone();
        let shared = self.cache.get_or_compute(&key, ttl, metadata, move || {
            this.fetch_remote(CancellationToken::new(), backend)
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = shared => result.map_err(SyncError::from),
        }
    }

    async fn fetch_remote(
        self,
        cancel: CancellationToken,
        backend: ResolvedBackend,
    ) -> Result<KeyValueSnapshot, SyncError> {
        match backend.kind {
            BackendKind::ParameterStore => self.fetch_parameters(&cancel, &backend.base_path).await,
            BackendKind::SecretsManager => self.fetch_document(&cancel, &backend.base_path).await,
        }
    }

    async fn fetch_parameters(
        &self,
        cancel: &CancellationToken,
        base_path: &str,
    ) -> Result<KeyValueSnapshot, SyncError> {
        let listing = self.list_parameters(cancel, base_path, false).await?;
        let keys: Vec<(String, String)> = listing
            .into_iter()
            .filter_map(|param| {
                let key = relative_name(base_path, &param.name)?.to_string();
                Some((key, param.name))
            })
            .collect();

        let total = keys.len();
        let slots: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(vec![None; total]));
        let items = keys
            .iter()
            .enumerate()
            .map(|(slot, (key, name))| self.get_item(cancel, slot, key, name, &slots))
            .collect();

        let results = self.dispatch(cancel, items).await;
        let attempted = results.len();
        aggregate(results)?;
        if attempted < total {
            return Err(SyncError::Cancelled);
        }

        let values = std::mem::take(&mut *lock(&slots));
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|((key, _), value)| value.map(|value| (key, value)))
            .collect())
    }

    fn get_item(
        &self,
        cancel: &CancellationToken,
        slot: usize,
        key: &str,
        name: &str,
        slots: &Arc<Mutex<Vec<Option<String>>>>,
    ) -> WorkItem {
        let name = name.to_string();
        let store = self.parameters.clone();
        let retry = self.retry.clone();
        let cancel = cancel.clone();
        let slots = slots.clone();
        WorkItem::new(key, move || async move {
            let param = retry
                .execute(&cancel, |_| {
                    let store = store.clone();
                    let name = name.clone();
                    async move { store.get(&name, true).await }
                })
                .await
                .map_err(|err| SyncError::remote(name, err))?;
            lock(&slots)[slot] = Some(param.value);
            Ok(())
        })
    }

    async fn fetch_document(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<KeyValueSnapshot, SyncError> {
        let fetched = self
            .retry
            .execute(cancel, |_| {
                let store = self.secrets.clone();
                let name = name.to_string();
                async move { store.get(&name).await }
            })
            .await;
        match fetched {
            Ok(document) => serde_json::from_str(&document).map_err(|source| SyncError::Document {
                name: name.to_string(),
                source,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(secret = name, "no remote document yet");
                Ok(KeyValueSnapshot::new())
            }
            Err(err) => Err(SyncError::remote(name, err)),
        }
    }

    async fn list_parameters(
        &self,
        cancel: &CancellationToken,
        base_path: &str,
        decrypt: bool,
    ) -> Result<Vec<Parameter>, SyncError> {
        self.retry
            .execute(cancel, |_| {
                let store = self.parameters.clone();
                let path = base_path.to_string();
                async move { store.list_by_prefix(&path, true, decrypt).await }
            })
            .await
            .map_err(|err| SyncError::remote(base_path, err))
    }

    /// The secret itself plus any secrets nested under `<name>/`.
    async fn list_secrets(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Vec<String>, SyncError> {
        let nested = format!("{name}/");
        let entries = self
            .retry
            .execute(cancel, |_| {
                let store = self.secrets.clone();
                let prefix = name.to_string();
                async move { store.list(&prefix).await }
            })
            .await
            .map_err(|err| SyncError::remote(name, err))?;
        Ok(entries
            .into_iter()
            .map(|entry| entry.name)
            .filter(|entry| entry == name || entry.starts_with(&nested))
            .collect())
    }

    async fn delete_parameter(&self, cancel: &CancellationToken, name: &str) -> Result<(), SyncError> {
        self.retry
            .execute(cancel, |_| {
                let store = self.parameters.clone();
                let name = name.to_string();
                async move { store.delete(&name).await }
            })
            .await
            .map_err(|err| SyncError::remote(name, err))
    }

    async fn delete_secret(&self, cancel: &CancellationToken, name: &str) -> Result<(), SyncError> {
        self.retry
            .execute(cancel, |_| {
                let store = self.secrets.clone();
                let name = name.to_string();
                async move { store.delete(&name, true).await }
            })
            .await
            .map_err(|err| SyncError::remote(name, err))
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run `items` in `batch_size` chunks. Progress events are renumbered so
    /// `completed`/`total` span all chunks.
    async fn dispatch(&self, cancel: &CancellationToken, items: Vec<WorkItem>) -> Vec<BatchResult> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut pending = items.into_iter().peekable();

        while pending.peek().is_some() {
            if cancel.is_cancelled() {
                tracing::debug!(remaining = total - results.len(), "dispatch cancelled");
                break;
            }
            let chunk: Vec<WorkItem> = pending.by_ref().take(self.batch_size).collect();
            let chunk_results = match &self.progress {
                None => process_batch(cancel, chunk, self.workers).await,
                Some(progress) => {
                    let offset = results.len();
                    let (tx, mut rx) = mpsc::unbounded_channel::<BatchProgress>();
                    let relay = async {
                        while let Some(mut event) = rx.recv().await {
                            event.completed += offset;
                            event.total = total;
                            let _ = progress.send(event);
                        }
                    };
                    let (chunk_results, ()) = tokio::join!(
                        process_batch_with_progress(cancel, chunk, self.workers, tx),
                        relay
                    );
                    chunk_results
                }
            };
            results.extend(chunk_results);
        }
        results
    }

    fn invalidate(&self, environment: &EnvironmentName, backend: &ResolvedBackend) {
        if self.cache.invalidate(&snapshot_key(environment, backend)) {
            tracing::debug!(environment = %environment, "remote snapshot cache invalidated");
        }
    }
}

fn snapshot_key(environment: &EnvironmentName, backend: &ResolvedBackend) -> String {
    cache_key(
        SNAPSHOT_NAMESPACE,
        &[&environment.0, &backend.region, &backend.base_path],
    )
}

fn already_exists(result: &BatchResult) -> bool {
    matches!(&result.result, Err(err) if err.kind() == Some(ErrorKind::AlreadyExists))
}

fn aborted(conflicts: &[Conflict]) -> SyncError {
    SyncError::Aborted {
        conflicts: conflicts.iter().map(|c| c.key.clone()).collect(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
