//! Shared configuration helpers for storefront services.
//!
//! A service describes its settings as a [`ServiceConfig`]. [`load`] starts
//! from the type's defaults, layers an optional YAML file named by
//! `<PREFIX>CONFIG` on top, and finally applies `<PREFIX>*` environment
//! overrides.

use std::env;
use std::fmt::Display;
use std::fs;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid listen address: {0}")]
    Address(#[from] AddrParseError),
}

/// Settings for a single service binary.
pub trait ServiceConfig: Default + DeserializeOwned {
    /// Prefix shared by every environment variable of this service, e.g. `AUTH_`.
    const PREFIX: &'static str;

    /// Apply `<PREFIX>*` environment variables on top of file and default values.
    fn apply_environment_overrides(&mut self, _env: &EnvOverrides<'_>) {}
}

/// Prefixed view over the process environment handed to
/// [`ServiceConfig::apply_environment_overrides`].
pub struct EnvOverrides<'a> {
    prefix: &'a str,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvOverrides<'a> {
    pub fn new(prefix: &'a str, lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { prefix, lookup }
    }

    /// Raw value of `<PREFIX><key>`; empty values count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", self.prefix, key)).filter(|value| !value.is_empty())
    }

    /// Parse `<PREFIX><key>` into `target`, keeping the current value when the
    /// variable is unset or malformed.
    pub fn apply<T>(&self, key: &str, target: &mut T)
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(parsed) = self.parse(key) {
            *target = parsed;
        }
    }

    pub fn apply_optional<T>(&self, key: &str, target: &mut Option<T>)
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(parsed) = self.parse(key) {
            *target = Some(parsed);
        }
    }

    fn parse<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self.get(key)?;
        value
            .parse::<T>()
            .inspect_err(|error| {
                tracing::warn!(
                    var = %format!("{}{}", self.prefix, key),
                    %value,
                    %error,
                    "invalid config override, keeping previous value"
                );
            })
            .ok()
    }
}

/// Resolve the port for a service from an environment variable.
///
/// Falls back to the provided default when the variable is missing or cannot be
/// parsed into a `u16`.
pub fn service_port(var: &str, default: u16) -> u16 {
    match env::var(var) {
        Ok(value) => value
            .parse::<u16>()
            .inspect_err(|error| {
                tracing::warn!(%var, %value, %error, "invalid port override, using default");
            })
            .unwrap_or(default),
        Err(_) => default,
    }
}

pub fn socket_addr(bind_address: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    Ok(format!("{bind_address}:{port}").parse()?)
}

/// Load a service configuration from the process environment.
pub fn load<T: ServiceConfig>() -> Result<T, ConfigError> {
    load_with(|name| env::var(name).ok())
}

/// Load a service configuration using `lookup` in place of the process
/// environment.
pub fn load_with<T, F>(lookup: F) -> Result<T, ConfigError>
where
    T: ServiceConfig,
    F: Fn(&str) -> Option<String>,
{
    let config_var = format!("{}CONFIG", T::PREFIX);
    let mut config = match lookup(&config_var).filter(|path| !path.is_empty()) {
        Some(path) => from_file::<T>(Path::new(&path))?,
        None => T::default(),
    };

    let env = EnvOverrides::new(T::PREFIX, &lookup);
    config.apply_environment_overrides(&env);
    Ok(config)
}

/// Read a YAML config file. Keys missing from the file keep their defaults as
/// long as `T` is annotated with `#[serde(default)]`.
pub fn from_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
