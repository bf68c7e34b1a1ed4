pub mod config;
pub mod error;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use common_auth::{
    AuthError, JsonFileStore, KeyValueStore, SessionValidator, StoreError, Token, TokenStore,
};
use common_obs::{
    health_router, metrics_router, request_context, session_validations_total,
    track_http_metrics,
};
use config::UserInfoConfig;
use error::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const SERVICE_NAME: &str = "userinfo-svc";
pub const USERNAME_HEADER: &str = "username";
pub const TOKEN_HEADER: &str = "authorization";

/// Profile record kept in the identity file under the user's name. Only a
/// JSON object parses; absent fields read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct UserDetails {
    pub name: String,
    pub email: String,
    pub age: String,
}

impl TryFrom<Map<String, Value>> for UserDetails {
    type Error = String;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut take = |field: &str| match fields.remove(field) {
            Some(Value::String(value)) => Ok(value),
            None | Some(Value::Null) => Ok(String::new()),
            Some(_) => Err(format!("`{field}` must be a string")),
        };
        Ok(Self {
            name: take("name")?,
            email: take("email")?,
            age: take("age")?,
        })
    }
}

impl UserDetails {
    fn missing_field(&self) -> Option<&'static str> {
        [
            ("name", &self.name),
            ("email", &self.email),
            ("age", &self.age),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty())
        .map(|(field, _)| field)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn KeyValueStore<Value>>,
    pub validator: SessionValidator,
}

impl AppState {
    /// Open both shared data files, creating each as `{}` when missing.
    pub async fn open(config: &UserInfoConfig) -> Result<Self, StoreError> {
        let users = JsonFileStore::<Value>::new(&config.users_path);
        let tokens = JsonFileStore::<Token>::new(&config.tokens_path);
        users.ensure_exists().await?;
        tokens.ensure_exists().await?;

        Ok(Self {
            users: Arc::new(users),
            validator: SessionValidator::new(TokenStore::new(Arc::new(tokens))),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/userdetails", get(user_details))
        .route("/useradd", post(add_user))
        .with_state(state)
        .merge(health_router(SERVICE_NAME))
        .merge(metrics_router())
        .layer(from_fn(track_http_metrics))
        .layer(from_fn(request_context))
}

async fn user_details(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserDetails>, ApiError> {
    let username = required_header(&headers, USERNAME_HEADER)?;
    let token = required_header(&headers, TOKEN_HEADER)?;

    if let Err(err) = state.validator.require(username, token).await {
        let outcome = match err {
            AuthError::InvalidSession => "invalid",
            _ => "error",
        };
        session_validations_total().inc(&[outcome], 1);
        return Err(err.into());
    }
    session_validations_total().inc(&["valid"], 1);

    let record = state
        .users
        .get(username)
        .await?
        .ok_or_else(|| ApiError::NotFound {
            message: format!("user {username} not found"),
        })?;

    serde_json::from_value(record).map(Json).map_err(|err| {
        tracing::error!(event = "user_record_invalid", username = %username, error = %err);
        ApiError::Internal
    })
}

async fn add_user(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let details: UserDetails =
        serde_json::from_slice(&body).map_err(|err| ApiError::Validation {
            message: format!("expected {{\"name\", \"email\", \"age\"}}: {err}"),
        })?;
    if let Some(field) = details.missing_field() {
        return Err(ApiError::Validation {
            message: format!("{field} must not be empty"),
        });
    }

    let record = serde_json::to_value(&details).map_err(|err| {
        tracing::error!(event = "user_record_encode_failed", error = %err);
        ApiError::Internal
    })?;

    if !state.users.insert_new(&details.name, record).await? {
        tracing::info!(event = "user_add_conflict", username = %details.name);
        return Err(ApiError::Conflict {
            message: format!("user {} already exists", details.name),
        });
    }

    tracing::info!(event = "user_added", username = %details.name);
    Ok(Json(json!({ "message": "User added successfully" })))
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::Validation {
            message: format!("missing {name} header"),
        })
}
