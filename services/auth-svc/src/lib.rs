pub mod config;
pub mod error;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::middleware::from_fn;
use axum::routing::post;
use axum::{Json, Router};
use common_auth::{
    AuthError, Authenticator, JsonCredentialStore, JsonFileStore, LoginClaim, OsRngIssuer,
    StoreError, Token, TokenStore,
};
use common_obs::{
    auth_attempts_total, health_router, metrics_router, request_context, track_http_metrics,
};
use config::AuthServiceConfig;
use error::ApiError;
use serde::Serialize;

pub const SERVICE_NAME: &str = "auth-svc";

const LOGIN_SUCCEEDED: &str = "Authentication successful";

#[derive(Clone)]
pub struct AppState {
    pub authenticator: Authenticator,
}

impl AppState {
    pub fn new(authenticator: Authenticator) -> Self {
        Self { authenticator }
    }

    /// Wire the file-backed stores named in `config`, creating an empty token
    /// file if there is none yet.
    pub async fn open(config: &AuthServiceConfig) -> Result<Self, StoreError> {
        let tokens = JsonFileStore::<Token>::new(&config.tokens_path);
        tokens.ensure_exists().await?;

        let credentials = JsonCredentialStore::open(&config.users_path)
            .with_secret_field(config.secret_field.clone());

        Ok(Self::new(Authenticator::new(
            Arc::new(credentials),
            Arc::new(OsRngIssuer),
            TokenStore::new(Arc::new(tokens)),
        )))
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub auth_token: String,
    pub message: &'static str,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth", post(login))
        .with_state(state)
        .merge(health_router(SERVICE_NAME))
        .merge(metrics_router())
        .layer(from_fn(track_http_metrics))
        .layer(from_fn(request_context))
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<LoginResponse>, ApiError> {
    let claim: LoginClaim = serde_json::from_slice(&body).map_err(|err| {
        record_attempt("bad_request");
        tracing::debug!(event = "login_malformed", error = %err);
        ApiError::Validation {
            message: format!("expected {{\"username\", \"password\"}}: {err}"),
        }
    })?;

    match state.authenticator.authenticate(&claim).await {
        Ok(session) => {
            record_attempt("success");
            Ok(Json(LoginResponse {
                auth_token: session.token.into_string(),
                message: LOGIN_SUCCEEDED,
            }))
        }
        Err(err) => {
            record_attempt(outcome_label(&err));
            Err(err.into())
        }
    }
}

fn outcome_label(error: &AuthError) -> &'static str {
    match error {
        AuthError::BadRequest(_) => "bad_request",
        AuthError::InvalidCredentials | AuthError::InvalidSession => "rejected",
        AuthError::StoreUnavailable(_) | AuthError::EntropyUnavailable(_) => "error",
    }
}

fn record_attempt(outcome: &str) {
    auth_attempts_total().inc(&[outcome], 1);
}
