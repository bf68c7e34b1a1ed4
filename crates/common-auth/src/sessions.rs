use std::path::Path;
use std::sync::Arc;

use crate::store::{JsonFileStore, KeyValueStore, Mapping, MemoryStore, StoreError};
use crate::token::Token;

/// Current session token per username (`{username: token}` on disk).
///
/// Holds at most one token per user: an upsert replaces whatever token the
/// user had, which invalidates it. Nothing is cached between calls.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore<Token>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore<Token>>) -> Self {
        Self { backend }
    }

    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(JsonFileStore::<Token>::new(path)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::<Token>::new()))
    }

    pub async fn upsert(&self, username: &str, token: &Token) -> Result<(), StoreError> {
        self.backend.upsert(username, token.clone()).await
    }

    pub async fn get(&self, username: &str) -> Result<Option<Token>, StoreError> {
        self.backend.get(username).await
    }

    pub async fn snapshot(&self) -> Result<Mapping<Token>, StoreError> {
        self.backend.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::token::TOKEN_BYTES;

    #[tokio::test]
    async fn upsert_replaces_the_previous_token() {
        let store = TokenStore::in_memory();
        let first = Token::from_bytes(&[1; TOKEN_BYTES]);
        let second = Token::from_bytes(&[2; TOKEN_BYTES]);

        store.upsert("alice", &first).await.unwrap();
        store.upsert("alice", &second).await.unwrap();

        assert_eq!(store.get("alice").await.unwrap(), Some(second));
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_layout_is_a_flat_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authtokens.json");
        let store = TokenStore::open(&path);
        let token = Token::from_bytes(&[0xcd; TOKEN_BYTES]);

        store.upsert("alice", &token).await.unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, serde_json::json!({ "alice": token.as_str() }));
    }

    #[tokio::test]
    async fn reads_tokens_written_by_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authtokens.json");
        std::fs::write(&path, r#"{"bob":"00112233445566778899aabbccddeeff"}"#).unwrap();

        let token = TokenStore::open(&path).get("bob").await.unwrap().unwrap();
        assert!(token.matches("00112233445566778899aabbccddeeff"));
    }
}
