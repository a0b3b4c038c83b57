//! Remote key-value capabilities.
//!
//! Two backends are modelled: a path-hierarchical [`ParameterStore`] with
//! one entry per key, and a document-style [`SecretStore`] holding a whole
//! environment as one JSON document. Implementations classify their own
//! failures into [`RemoteError`] before returning them.
//!
//! [`memory`] provides instrumented in-process stores; [`file`] persists
//! JSON state under `<home>/.keysync/remote/<region>/`.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

pub use file::{FileParameterStore, FileSecretStore};
pub use memory::{CallCounts, InMemoryParameterStore, InMemorySecretStore, Operation};

/// Value shown in place of a `SecureString` read without decryption.
pub const REDACTED: &str = "********";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    #[default]
    String,
    SecureString,
}

/// One parameter as returned by the store. `name` is the full path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    pub kind: ParameterType,
}

impl Parameter {
    /// A copy whose value is hidden unless `decrypt` or not a secure string.
    pub(crate) fn view(&self, decrypt: bool) -> Parameter {
        let mut view = self.clone();
        if !decrypt && self.kind == ParameterType::SecureString {
            view.value = REDACTED.to_string();
        }
        view
    }
}

/// A secret listing entry; the document itself is fetched with `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Write one parameter. With `overwrite == false` an existing name fails
    /// with `AlreadyExists`.
    async fn put(
        &self,
        name: &str,
        value: &str,
        kind: ParameterType,
        overwrite: bool,
    ) -> Result<(), RemoteError>;

    async fn get(&self, name: &str, decrypt: bool) -> Result<Parameter, RemoteError>;

    /// Parameters under `path`. Non-recursive listings return direct
    /// children only.
    async fn list_by_prefix(
        &self,
        path: &str,
        recursive: bool,
        decrypt: bool,
    ) -> Result<Vec<Parameter>, RemoteError>;

    async fn delete(&self, name: &str) -> Result<(), RemoteError>;

    /// Delete every parameter under `path`; returns how many were removed.
    async fn delete_by_prefix(&self, path: &str) -> Result<usize, RemoteError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// The document stored under `name`.
    async fn get(&self, name: &str) -> Result<String, RemoteError>;

    async fn create_or_update(
        &self,
        name: &str,
        description: &str,
        document: &str,
    ) -> Result<(), RemoteError>;

    /// Remove `name`. `force` skips any recovery window.
    async fn delete(&self, name: &str, force: bool) -> Result<(), RemoteError>;

    async fn list(&self, prefix: &str) -> Result<Vec<SecretEntry>, RemoteError>;
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `base` and `key` joined by exactly one `/`.
pub fn join_name(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

/// `name` relative to `base`, if it lives under it.
pub fn relative_name<'a>(base: &str, name: &'a str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    name.strip_prefix(base)?
        .strip_prefix('/')
        .filter(|rest| !rest.is_empty())
}

/// Whether `name` is listed under `path` for the given recursion mode.
pub(crate) fn under_prefix(path: &str, name: &str, recursive: bool) -> bool {
    match relative_name(path, name) {
        Some(rest) => recursive || !rest.contains('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/app/dev", "DB_HOST", "/app/dev/DB_HOST")]
    #[case("/app/dev/", "DB_HOST", "/app/dev/DB_HOST")]
    #[case("/app/dev", "/DB_HOST", "/app/dev/DB_HOST")]
    fn join_uses_single_separator(#[case] base: &str, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(join_name(base, key), expected);
    }

    #[test]
    fn relative_name_requires_separator_boundary() {
        assert_eq!(relative_name("/app/dev", "/app/dev/A"), Some("A"));
        assert_eq!(relative_name("/app/dev", "/app/development/A"), None);
        assert_eq!(relative_name("/app/dev", "/app/dev"), None);
    }

    #[test]
    fn non_recursive_listing_skips_nested_names() {
        assert!(under_prefix("/app", "/app/A", false));
        assert!(!under_prefix("/app", "/app/x/A", false));
        assert!(under_prefix("/app", "/app/x/A", true));
    }

    #[test]
    fn secure_values_are_redacted_without_decrypt() {
        let p = Parameter {
            name: "/app/TOKEN".into(),
            value: "abc".into(),
            kind: ParameterType::SecureString,
        };
        assert_eq!(p.view(false).value, REDACTED);
        assert_eq!(p.view(true).value, "abc");
    }
}
