use std::net::SocketAddr;
use std::path::PathBuf;

use common_auth::{DEFAULT_SECRET_FIELD, DEFAULT_TOKENS_FILE, DEFAULT_USERS_FILE};
use common_config::{ConfigError, EnvOverrides, ServiceConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthServiceConfig {
    pub bind_address: String,
    pub port: u16,
    pub users_path: PathBuf,
    pub tokens_path: PathBuf,
    /// Field of each identity record compared against the presented password.
    pub secret_field: String,
    pub log_file: Option<PathBuf>,
}

impl Default for AuthServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8082,
            users_path: PathBuf::from(DEFAULT_USERS_FILE),
            tokens_path: PathBuf::from(DEFAULT_TOKENS_FILE),
            secret_field: DEFAULT_SECRET_FIELD.to_string(),
            log_file: None,
        }
    }
}

impl AuthServiceConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        common_config::socket_addr(&self.bind_address, self.port)
    }
}

impl ServiceConfig for AuthServiceConfig {
    const PREFIX: &'static str = "AUTH_";

    fn apply_environment_overrides(&mut self, env: &EnvOverrides<'_>) {
        env.apply("BIND_ADDRESS", &mut self.bind_address);
        env.apply("PORT", &mut self.port);
        env.apply("USERS_PATH", &mut self.users_path);
        env.apply("TOKENS_PATH", &mut self.tokens_path);
        env.apply("SECRET_FIELD", &mut self.secret_field);
        env.apply_optional("LOG_FILE", &mut self.log_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    #[test]
    fn environment_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AUTH_PORT", "9000"),
            ("AUTH_TOKENS_PATH", "/tmp/tokens.json"),
            ("AUTH_LOG_FILE", "/logs/auth.log"),
        ]);
        let config: AuthServiceConfig =
            common_config::load_with(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.tokens_path, PathBuf::from("/tmp/tokens.json"));
        assert_eq!(config.users_path, PathBuf::from(DEFAULT_USERS_FILE));
        assert_eq!(config.log_file, Some(PathBuf::from("/logs/auth.log")));
        assert_eq!(config.socket_addr().unwrap().port(), 9000);
    }
}
