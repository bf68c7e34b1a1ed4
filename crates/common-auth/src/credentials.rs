use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::{JsonFileStore, KeyValueStore, StoreError};

/// Identity record field holding the shared secret unless configured otherwise.
pub const DEFAULT_SECRET_FIELD: &str = "name";

/// Shared secret of a registered identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Exact-match comparison with the secret a client supplied.
    pub fn matches(&self, presented: &str) -> bool {
        self.0 == presented
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Read-only view of registered identities.
///
/// Implementations load fresh data on every call; the identity file is
/// written by the sign-up flow at any time.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, username: &str) -> Result<Option<Secret>, StoreError>;

    /// Whether `presented` is the secret registered for `username`. Unknown
    /// usernames and mismatches both yield `false`.
    async fn verify(&self, username: &str, presented: &str) -> Result<bool, StoreError> {
        Ok(self
            .lookup(username)
            .await?
            .is_some_and(|secret| secret.matches(presented)))
    }
}

/// Credential store over the identity file
/// (`{username: {"name": ..., "email": ..., ...}}`).
#[derive(Clone)]
pub struct JsonCredentialStore {
    records: Arc<dyn KeyValueStore<Value>>,
    secret_field: String,
}

impl JsonCredentialStore {
    pub fn new(records: Arc<dyn KeyValueStore<Value>>, secret_field: impl Into<String>) -> Self {
        Self {
            records,
            secret_field: secret_field.into(),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::new(
            Arc::new(JsonFileStore::<Value>::new(path)),
            DEFAULT_SECRET_FIELD,
        )
    }

    pub fn with_secret_field(mut self, field: impl Into<String>) -> Self {
        self.secret_field = field.into();
        self
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn lookup(&self, username: &str) -> Result<Option<Secret>, StoreError> {
        let record = self.records.get(username).await?;
        Ok(record
            .as_ref()
            .and_then(|record| record.get(&self.secret_field))
            .and_then(Value::as_str)
            .map(Secret::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::store::MemoryStore;

    fn store_with(records: Vec<(&str, Value)>) -> JsonCredentialStore {
        JsonCredentialStore::new(
            Arc::new(MemoryStore::with_entries(records)),
            DEFAULT_SECRET_FIELD,
        )
    }

    #[tokio::test]
    async fn lookup_reads_the_secret_field() {
        let store = store_with(vec![(
            "alice",
            json!({ "name": "alice", "email": "alice@example.com", "age": "30" }),
        )]);

        let secret = store.lookup("alice").await.unwrap().expect("registered");
        assert!(secret.matches("alice"));
        assert!(store.lookup("mallory").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_without_the_field_are_absent() {
        let store = store_with(vec![
            ("nofield", json!({ "email": "x@example.com" })),
            ("scalar", json!("just a string")),
            ("numeric", json!({ "name": 42 })),
        ]);

        for username in ["nofield", "scalar", "numeric"] {
            assert!(store.lookup(username).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn verify_is_exact_match() {
        let store = store_with(vec![("alice", json!({ "name": "alice" }))]);

        assert!(store.verify("alice", "alice").await.unwrap());
        assert!(!store.verify("alice", "Alice").await.unwrap());
        assert!(!store.verify("alice", "alice ").await.unwrap());
        assert!(!store.verify("bob", "bob").await.unwrap());
    }

    #[tokio::test]
    async fn secret_field_is_configurable() {
        let store = store_with(vec![(
            "alice",
            json!({ "name": "alice", "password": "hunter2" }),
        )])
        .with_secret_field("password");

        assert!(store.verify("alice", "hunter2").await.unwrap());
        assert!(!store.verify("alice", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn empty_identity_file_finds_nobody() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{}").unwrap();

        let store = JsonCredentialStore::open(&path);
        assert!(store.lookup("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_identity_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonCredentialStore::open(&path);
        assert!(matches!(
            store.lookup("alice").await,
            Err(StoreError::Parse { .. })
        ));
    }
}
