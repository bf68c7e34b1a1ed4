use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::credentials::CredentialStore;
use crate::sessions::TokenStore;
use crate::store::StoreError;
use crate::token::{EntropyError, Token, TokenIssuer};

/// Login request body: a JSON object with string `username` and `password`.
#[derive(Clone, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct LoginClaim {
    pub username: String,
    pub password: String,
}

impl TryFrom<Map<String, Value>> for LoginClaim {
    type Error = String;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut take = |field: &str| match fields.remove(field) {
            Some(Value::String(value)) => Ok(value),
            Some(_) => Err(format!("`{field}` must be a string")),
            None => Err(format!("missing field `{field}`")),
        };
        Ok(Self {
            username: take("username")?,
            password: take("password")?,
        })
    }
}

impl std::fmt::Debug for LoginClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginClaim")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Token that has been persisted as the user's current session.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub username: String,
    pub token: Token,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired session")]
    InvalidSession,
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error(transparent)]
    EntropyUnavailable(#[from] EntropyError),
}

/// Progress of a single login, recorded on failure logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    Received,
    CredentialChecked,
    TokenIssued,
    Persisted,
}

impl AuthStage {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStage::Received => "received",
            AuthStage::CredentialChecked => "credential_checked",
            AuthStage::TokenIssued => "token_issued",
            AuthStage::Persisted => "persisted",
        }
    }
}

/// Verifies a login claim and issues a fresh session token.
#[derive(Clone)]
pub struct Authenticator {
    credentials: Arc<dyn CredentialStore>,
    issuer: Arc<dyn TokenIssuer>,
    sessions: TokenStore,
}

impl Authenticator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        issuer: Arc<dyn TokenIssuer>,
        sessions: TokenStore,
    ) -> Self {
        Self {
            credentials,
            issuer,
            sessions,
        }
    }

    /// Checks the claim against the identity store and, on success, replaces
    /// the user's current token with a newly generated one.
    ///
    /// A token is only returned once it has been written to the token store;
    /// rejected claims never touch the token store.
    pub async fn authenticate(&self, claim: &LoginClaim) -> Result<IssuedSession, AuthError> {
        let mut stage = AuthStage::Received;
        let result = self.run(claim, &mut stage).await;
        match &result {
            Ok(_) => {
                tracing::info!(
                    event = "login_succeeded",
                    username = %claim.username,
                    stage = stage.as_str()
                );
            }
            Err(AuthError::InvalidCredentials | AuthError::BadRequest(_)) => {
                tracing::info!(
                    event = "login_rejected",
                    username = %claim.username,
                    stage = stage.as_str()
                );
            }
            Err(error) => {
                tracing::error!(
                    event = "login_failed",
                    username = %claim.username,
                    stage = stage.as_str(),
                    error = %error
                );
            }
        }
        result
    }

    async fn run(
        &self,
        claim: &LoginClaim,
        stage: &mut AuthStage,
    ) -> Result<IssuedSession, AuthError> {
        if claim.username.is_empty() {
            return Err(AuthError::BadRequest("username must not be empty".into()));
        }

        if !self
            .credentials
            .verify(&claim.username, &claim.password)
            .await?
        {
            return Err(AuthError::InvalidCredentials);
        }
        *stage = AuthStage::CredentialChecked;

        let token = self.issuer.generate()?;
        *stage = AuthStage::TokenIssued;

        self.sessions.upsert(&claim.username, &token).await?;
        *stage = AuthStage::Persisted;

        Ok(IssuedSession {
            username: claim.username.clone(),
            token,
        })
    }
}
