use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Bytes of entropy behind every session token.
pub const TOKEN_BYTES: usize = 16;

/// Opaque session token, rendered as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn from_bytes(bytes: &[u8; TOKEN_BYTES]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Exact comparison against a token presented by a client.
    pub fn matches(&self, presented: &str) -> bool {
        self.0 == presented
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("entropy source unavailable: {reason}")]
pub struct EntropyError {
    reason: String,
}

impl EntropyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<rand::Error> for EntropyError {
    fn from(error: rand::Error) -> Self {
        Self::new(error.to_string())
    }
}

pub trait TokenIssuer: Send + Sync {
    fn generate(&self) -> Result<Token, EntropyError>;
}

/// Draws token bytes from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRngIssuer;

impl TokenIssuer for OsRngIssuer {
    fn generate(&self) -> Result<Token, EntropyError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Token::from_bytes(&bytes))
    }
}
