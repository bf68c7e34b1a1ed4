use std::net::SocketAddr;
use std::path::PathBuf;

use common_auth::{DEFAULT_TOKENS_FILE, DEFAULT_USERS_FILE};
use common_config::{ConfigError, EnvOverrides, ServiceConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserInfoConfig {
    pub bind_address: String,
    pub port: u16,
    pub users_path: PathBuf,
    pub tokens_path: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl Default for UserInfoConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8083,
            users_path: PathBuf::from(DEFAULT_USERS_FILE),
            tokens_path: PathBuf::from(DEFAULT_TOKENS_FILE),
            log_file: None,
        }
    }
}

impl UserInfoConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        common_config::socket_addr(&self.bind_address, self.port)
    }
}

impl ServiceConfig for UserInfoConfig {
    const PREFIX: &'static str = "USERINFO_";

    fn apply_environment_overrides(&mut self, env: &EnvOverrides<'_>) {
        env.apply("BIND_ADDRESS", &mut self.bind_address);
        env.apply("PORT", &mut self.port);
        env.apply("USERS_PATH", &mut self.users_path);
        env.apply("TOKENS_PATH", &mut self.tokens_path);
        env.apply_optional("LOG_FILE", &mut self.log_file);
    }
}
