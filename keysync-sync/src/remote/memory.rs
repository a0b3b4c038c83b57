//! In-process remote stores with call counters, scripted failures, and
//! optional latency.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{under_prefix, Parameter, ParameterStore, ParameterType, SecretEntry, SecretStore};
use crate::error::RemoteError;

/// Remote call categories used for counting and failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Get,
    List,
    Delete,
}

/// Calls made so far, per category.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub puts: usize,
    pub gets: usize,
    pub lists: usize,
    pub deletes: usize,
}

// ---------------------------------------------------------------------------
// Shared instrumentation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Instrumentation {
    puts: AtomicUsize,
    gets: AtomicUsize,
    lists: AtomicUsize,
    deletes: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Option<Duration>,
    scripted: Mutex<HashMap<Operation, VecDeque<RemoteError>>>,
    by_name: Mutex<HashMap<String, RemoteError>>,
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Instrumentation {
    /// Record the call, apply latency, then fail it if a failure is scripted
    /// for this operation or name.
    async fn enter(&self, op: Operation, name: &str) -> Result<CallGuard<'_>, RemoteError> {
        let counter = match op {
            Operation::Put => &self.puts,
            Operation::Get => &self.gets,
            Operation::List => &self.lists,
            Operation::Delete => &self.deletes,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = lock(&self.scripted)
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        if let Some(err) = lock(&self.by_name).get(name) {
            return Err(err.clone());
        }
        Ok(guard)
    }

    fn counts(&self) -> CallCounts {
        CallCounts {
            puts: self.puts.load(Ordering::SeqCst),
            gets: self.gets.load(Ordering::SeqCst),
            lists: self.lists.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    fn fail_next(&self, op: Operation, err: RemoteError) {
        lock(&self.scripted).entry(op).or_default().push_back(err);
    }

    fn fail_name(&self, name: &str, err: RemoteError) {
        lock(&self.by_name).insert(name.to_string(), err);
    }

    fn clear_failures(&self) {
        lock(&self.scripted).clear();
        lock(&self.by_name).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

macro_rules! instrumented {
    ($store:ident) => {
        impl $store {
            /// Delay every call by `latency`.
            pub fn with_latency(mut self, latency: Duration) -> Self {
                self.calls.latency = Some(latency);
                self
            }

            /// Fail the next call of kind `op` with `err`. Repeated calls queue
            /// further failures.
            pub fn fail_next(&self, op: Operation, err: RemoteError) {
                self.calls.fail_next(op, err);
            }

            /// Fail every call addressing `name` with `err`.
            pub fn fail_name(&self, name: &str, err: RemoteError) {
                self.calls.fail_name(name, err);
            }

            pub fn clear_failures(&self) {
                self.calls.clear_failures();
            }

            pub fn counts(&self) -> CallCounts {
                self.calls.counts()
            }

            /// Highest number of calls that were in progress at once.
            pub fn peak_concurrency(&self) -> usize {
                self.calls.peak.load(Ordering::SeqCst)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Parameter store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    params: Mutex<BTreeMap<String, Parameter>>,
    calls: Instrumentation,
}

instrumented!(InMemoryParameterStore);

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a parameter without counting a call.
    pub fn insert(&self, name: &str, value: &str, kind: ParameterType) {
        lock(&self.params).insert(
            name.to_string(),
            Parameter {
                name: name.to_string(),
                value: value.to_string(),
                kind,
            },
        );
    }

    /// Every stored parameter, keyed by full name.
    pub fn parameters(&self) -> BTreeMap<String, Parameter> {
        lock(&self.params).clone()
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn put(
        &self,
        name: &str,
        value: &str,
        kind: ParameterType,
        overwrite: bool,
    ) -> Result<(), RemoteError> {
        let _call = self.calls.enter(Operation::Put, name).await?;
        let mut params = lock(&self.params);
        if !overwrite && params.contains_key(name) {
            return Err(RemoteError::already_exists(format!(
                "parameter {name} already exists"
            )));
        }
        params.insert(
            name.to_string(),
            Parameter {
                name: name.to_string(),
                value: value.to_string(),
                kind,
            },
        );
        Ok(())
    }

    async fn get(&self, name: &str, decrypt: bool) -> Result<Parameter, RemoteError> {
        let _call = self.calls.enter(Operation::Get, name).await?;
        lock(&self.params)
            .get(name)
            .map(|p| p.view(decrypt))
            .ok_or_else(|| RemoteError::not_found(format!("parameter {name} not found")))
    }

    async fn list_by_prefix(
        &self,
        path: &str,
        recursive: bool,
        decrypt: bool,
    ) -> Result<Vec<Parameter>, RemoteError> {
        let _call = self.calls.enter(Operation::List, path).await?;
        Ok(lock(&self.params)
            .values()
            .filter(|p| under_prefix(path, &p.name, recursive))
            .map(|p| p.view(decrypt))
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), RemoteError> {
        let _call = self.calls.enter(Operation::Delete, name).await?;
        lock(&self.params)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("parameter {name} not found")))
    }

    async fn delete_by_prefix(&self, path: &str) -> Result<usize, RemoteError> {
        let _call = self.calls.enter(Operation::Delete, path).await?;
        let mut params = lock(&self.params);
        let before = params.len();
        params.retain(|name, _| !under_prefix(path, name, true));
        Ok(before - params.len())
    }
}

// ---------------------------------------------------------------------------
// Secret store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredSecret {
    description: String,
    document: String,
}

#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<BTreeMap<String, StoredSecret>>,
    calls: Instrumentation,
}

instrumented!(InMemorySecretStore);

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret without counting a call.
    pub fn insert(&self, name: &str, document: &str) {
        lock(&self.secrets).insert(
            name.to_string(),
            StoredSecret {
                description: String::new(),
                document: document.to_string(),
            },
        );
    }

    /// The raw document stored under `name`.
    pub fn document(&self, name: &str) -> Option<String> {
        lock(&self.secrets).get(name).map(|s| s.document.clone())
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.secrets).keys().cloned().collect()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> Result<String, RemoteError> {
        let _call = self.calls.enter(Operation::Get, name).await?;
        lock(&self.secrets)
            .get(name)
            .map(|s| s.document.clone())
            .ok_or_else(|| RemoteError::not_found(format!("secret {name} not found")))
    }

    async fn create_or_update(
        &self,
        name: &str,
        description: &str,
        document: &str,
    ) -> Result<(), RemoteError> {
        let _call = self.calls.enter(Operation::Put, name).await?;
        lock(&self.secrets).insert(
            name.to_string(),
            StoredSecret {
                description: description.to_string(),
                document: document.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str, _force: bool) -> Result<(), RemoteError> {
        let _call = self.calls.enter(Operation::Delete, name).await?;
        lock(&self.secrets)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("secret {name} not found")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SecretEntry>, RemoteError> {
        let _call = self.calls.enter(Operation::List, prefix).await?;
        Ok(lock(&self.secrets)
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, secret)| SecretEntry {
                name: name.clone(),
                description: (!secret.description.is_empty()).then(|| secret.description.clone()),
            })
            .collect())
    }
}
