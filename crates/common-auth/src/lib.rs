//! Credential verification and session tokens shared by the storefront services.
//!
//! Identities live in a JSON object file keyed by username; the current
//! session token of each user lives in a second file of the same shape.
//! Both are accessed through [`KeyValueStore`] so the services can share
//! them across processes.

#![deny(unsafe_code)]

pub mod authenticator;
pub mod credentials;
pub mod sessions;
pub mod store;
pub mod token;
pub mod validator;

pub use authenticator::{AuthError, AuthStage, Authenticator, IssuedSession, LoginClaim};
pub use credentials::{CredentialStore, JsonCredentialStore, Secret, DEFAULT_SECRET_FIELD};
pub use sessions::TokenStore;
pub use store::{JsonFileStore, KeyValueStore, Mapping, MemoryStore, StoreError};
pub use token::{EntropyError, OsRngIssuer, Token, TokenIssuer, TOKEN_BYTES};
pub use validator::SessionValidator;

/// Identity file shared between the storefront services.
pub const DEFAULT_USERS_FILE: &str = "/app/shared_data/users.json";

/// Token file shared between the storefront services.
pub const DEFAULT_TOKENS_FILE: &str = "/app/shared_data/authtokens.json";
