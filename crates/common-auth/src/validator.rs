use crate::authenticator::AuthError;
use crate::sessions::TokenStore;
use crate::store::StoreError;

/// Checks presented tokens against the token store. Read-only.
#[derive(Clone)]
pub struct SessionValidator {
    sessions: TokenStore,
}

impl SessionValidator {
    pub fn new(sessions: TokenStore) -> Self {
        Self { sessions }
    }

    /// `true` only when `username` has a current token equal to `presented`.
    /// Store failures surface as errors rather than `false`.
    pub async fn validate(&self, username: &str, presented: &str) -> Result<bool, StoreError> {
        let current = self.sessions.get(username).await?;
        Ok(current.is_some_and(|token| token.matches(presented)))
    }

    pub async fn require(&self, username: &str, presented: &str) -> Result<(), AuthError> {
        if self.validate(username, presented).await? {
            Ok(())
        } else {
            tracing::debug!(event = "session_rejected", username = %username);
            Err(AuthError::InvalidSession)
        }
    }
}
