//! JSON-file remote stores.
//!
//! State lives under `<home>/.keysync/remote/<region>/` in
//! `parameters.json` and `secrets.json`. Each mutation is a
//! read-modify-write under an in-process lock, written atomically via a
//! `.tmp` sibling (mode 0600) and rename.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{under_prefix, Parameter, ParameterStore, ParameterType, SecretEntry, SecretStore};
use crate::error::RemoteError;

/// `<home>/.keysync/remote/<region>`
pub fn remote_dir_at(home: &Path, region: &str) -> PathBuf {
    keysync_core::config::keysync_root(home)
        .join("remote")
        .join(region)
}

fn io_failure(path: &Path, err: std::io::Error) -> RemoteError {
    RemoteError::generic(format!("{}: {err}", path.display()))
}

async fn read_state<T: DeserializeOwned + Default>(path: &Path) -> Result<T, RemoteError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            RemoteError::generic(format!("corrupt remote state {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(io_failure(path, err)),
    }
}

async fn write_state<T: Serialize>(path: &Path, state: &T) -> Result<(), RemoteError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|err| RemoteError::generic(format!("encode remote state: {err}")))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| io_failure(&tmp, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io_failure(&tmp, e))?;
    }

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_failure(path, e))
}

// ---------------------------------------------------------------------------
// Parameter store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredParameter {
    value: String,
    kind: ParameterType,
    version: u64,
    last_modified: DateTime<Utc>,
}

type ParameterState = BTreeMap<String, StoredParameter>;

#[derive(Debug)]
pub struct FileParameterStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileParameterStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// The store for `region` under `home`.
    pub fn at(home: &Path, region: &str) -> Self {
        Self::new(remote_dir_at(home, region).join("parameters.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn to_parameter(name: &str, stored: &StoredParameter, decrypt: bool) -> Parameter {
    Parameter {
        name: name.to_string(),
        value: stored.value.clone(),
        kind: stored.kind,
    }
    .view(decrypt)
}

#[async_trait]
impl ParameterStore for FileParameterStore {
    async fn put(
        &self,
        name: &str,
        value: &str,
        kind: ParameterType,
        overwrite: bool,
    ) -> Result<(), RemoteError> {
        let _guard = self.lock.lock().await;
        let mut state: ParameterState = read_state(&self.path).await?;
        let version = match state.get(name) {
            Some(_) if !overwrite => {
                return Err(RemoteError::already_exists(format!(
                    "parameter {name} already exists"
                )))
            }
            Some(existing) => existing.version + 1,
            None => 1,
        };
        state.insert(
            name.to_string(),
            StoredParameter {
                value: value.to_string(),
                kind,
                version,
                last_modified: Utc::now(),
            },
        );
        write_state(&self.path, &state).await
    }

    async fn get(&self, name: &str, decrypt: bool) -> Result<Parameter, RemoteError> {
        let _guard = self.lock.lock().await;
        let state: ParameterState = read_state(&self.path).await?;
        state
            .get(name)
            .map(|stored| to_parameter(name, stored, decrypt))
            .ok_or_else(|| RemoteError::not_found(format!("parameter {name} not found")))
    }

    async fn list_by_prefix(
        &self,
        path: &str,
        recursive: bool,
        decrypt: bool,
    ) -> Result<Vec<Parameter>, RemoteError> {
        let _guard = self.lock.lock().await;
        let state: ParameterState = read_state(&self.path).await?;
        Ok(state
            .iter()
            .filter(|(name, _)| under_prefix(path, name, recursive))
            .map(|(name, stored)| to_parameter(name, stored, decrypt))
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), RemoteError> {
        let _guard = self.lock.lock().await;
        let mut state: ParameterState = read_state(&self.path).await?;
        if state.remove(name).is_none() {
            return Err(RemoteError::not_found(format!("parameter {name} not found")));
        }
        write_state(&self.path, &state).await
    }

    async fn delete_by_prefix(&self, path: &str) -> Result<usize, RemoteError> {
        let _guard = self.lock.lock().await;
        let mut state: ParameterState = read_state(&self.path).await?;
        let before = state.len();
        state.retain(|name, _| !under_prefix(path, name, true));
        let removed = before - state.len();
        if removed > 0 {
            write_state(&self.path, &state).await?;
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Secret store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    #[serde(default)]
    description: String,
    document: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

type SecretState = BTreeMap<String, StoredSecret>;

#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// The store for `region` under `home`.
    pub fn at(home: &Path, region: &str) -> Self {
        Self::new(remote_dir_at(home, region).join("secrets.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, name: &str) -> Result<String, RemoteError> {
        let _guard = self.lock.lock().await;
        let state: SecretState = read_state(&self.path).await?;
        state
            .get(name)
            .map(|secret| secret.document.clone())
            .ok_or_else(|| RemoteError::not_found(format!("secret {name} not found")))
    }

    async fn create_or_update(
        &self,
        name: &str,
        description: &str,
        document: &str,
    ) -> Result<(), RemoteError> {
        let _guard = self.lock.lock().await;
        let mut state: SecretState = read_state(&self.path).await?;
        let now = Utc::now();
        let created_at = state.get(name).map_or(now, |existing| existing.created_at);
        state.insert(
            name.to_string(),
            StoredSecret {
                description: description.to_string(),
                document: document.to_string(),
                created_at,
                updated_at: now,
            },
        );
        write_state(&self.path, &state).await
    }

    async fn delete(&self, name: &str, _force: bool) -> Result<(), RemoteError> {
        let _guard = self.lock.lock().await;
        let mut state: SecretState = read_state(&self.path).await?;
        if state.remove(name).is_none() {
            return Err(RemoteError::not_found(format!("secret {name} not found")));
        }
        write_state(&self.path, &state).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SecretEntry>, RemoteError> {
        let _guard = self.lock.lock().await;
        let state: SecretState = read_state(&self.path).await?;
        Ok(state
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, secret)| SecretEntry {
                name: name.clone(),
                description: (!secret.description.is_empty()).then(|| secret.description.clone()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn parameters_persist_across_instances() {
        let home = TempDir::new().expect("home");
        let store = FileParameterStore::at(home.path(), "us-east-1");
        store
            .put("/app/dev/PORT", "8080", ParameterType::String, false)
            .await
            .expect("put");

        let reopened = FileParameterStore::at(home.path(), "us-east-1");
        let param = reopened.get("/app/dev/PORT", false).await.expect("get");
        assert_eq!(param.value, "8080");
        assert!(reopened.path().ends_with("remote/us-east-1/parameters.json"));
    }

    #[tokio::test]
    async fn regions_are_isolated() {
        let home = TempDir::new().expect("home");
        FileParameterStore::at(home.path(), "us-east-1")
            .put("/app/A", "1", ParameterType::String, false)
            .await
            .expect("put");

        let other = FileParameterStore::at(home.path(), "eu-west-1");
        let err = other.get("/app/A", true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn overwrite_false_conflicts_and_versions_increment() {
        let home = TempDir::new().expect("home");
        let store = FileParameterStore::at(home.path(), "us-east-1");
        store
            .put("/app/A", "1", ParameterType::String, false)
            .await
            .expect("put");
        let err = store
            .put("/app/A", "2", ParameterType::String, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        store
            .put("/app/A", "2", ParameterType::String, true)
            .await
            .expect("overwrite");
        let state: ParameterState = read_state(store.path()).await.expect("state");
        assert_eq!(state["/app/A"].version, 2);
    }

    #[tokio::test]
    async fn delete_by_prefix_removes_nested_names() {
        let home = TempDir::new().expect("home");
        let store = FileParameterStore::at(home.path(), "us-east-1");
        for name in ["/app/dev/A", "/app/dev/x/B", "/app/prod/A"] {
            store
                .put(name, "v", ParameterType::String, false)
                .await
                .expect("put");
        }

        assert_eq!(store.delete_by_prefix("/app/dev").await.expect("delete"), 2);
        let left = store.list_by_prefix("/app", true, true).await.expect("list");
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn secret_update_keeps_created_at() {
        let home = TempDir::new().expect("home");
        let store = FileSecretStore::at(home.path(), "us-east-1");
        store
            .create_or_update("app/dev", "dev env", "{\"A\":\"1\"}")
            .await
            .expect("create");
        let created: SecretState = read_state(store.path()).await.expect("state");

        store
            .create_or_update("app/dev", "dev env", "{\"A\":\"2\"}")
            .await
            .expect("update");
        let updated: SecretState = read_state(store.path()).await.expect("state");

        assert_eq!(created["app/dev"].created_at, updated["app/dev"].created_at);
        assert_eq!(store.get("app/dev").await.expect("get"), "{\"A\":\"2\"}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let home = TempDir::new().expect("home");
        let store = FileSecretStore::at(home.path(), "us-east-1");
        store
            .create_or_update("app/dev", "", "{}")
            .await
            .expect("create");
        let mode = std::fs::metadata(store.path())
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
