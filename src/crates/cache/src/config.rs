//! Cache service configuration
//!
//! Loaded from a JSON file passed as the binary's only positional argument,
//! or derived from `CACHE_*` environment variables when no file is given.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::StorageType;
use crate::store::CacheLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Cache server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheServiceConfig {
    pub host: String,
    pub port: u16,
    pub storage_type: StorageType,
    /// Base directory for the filesystem backend
    pub storage_dir: PathBuf,
    /// Base URL for the object-store backend
    pub object_store_url: Option<String>,
    pub max_cache_size: u64,
    pub max_entry_size: u64,
    pub default_ttl_seconds: u64,
    pub cleanup_period_seconds: u64,
    pub authentication: bool,
    pub auth_token: Option<String>,
}

impl Default for CacheServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
            storage_type: StorageType::Filesystem,
            storage_dir: PathBuf::from("/var/lib/gantry/cache"),
            object_store_url: None,
            max_cache_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            max_entry_size: 1024 * 1024 * 1024,
            default_ttl_seconds: 0,
            cleanup_period_seconds: 3600, // hourly sweep
            authentication: false,
            auth_token: None,
        }
    }
}

impl CacheServiceConfig {
    /// Load from `path` when given, otherwise from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                serde_json::from_str(&contents)?
            }
            None => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("CACHE_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("CACHE_PORT") {
            config.port = parse_var("CACHE_PORT", &port)?;
        }
        if let Ok(storage_type) = std::env::var("CACHE_STORAGE_TYPE") {
            config.storage_type = match storage_type.as_str() {
                "filesystem" => StorageType::Filesystem,
                "object-store" => StorageType::ObjectStore,
                "memory" => StorageType::Memory,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "CACHE_STORAGE_TYPE must be filesystem, object-store, or memory, got {other:?}"
                    )))
                }
            };
        }
        if let Ok(dir) = std::env::var("CACHE_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("CACHE_OBJECT_STORE_URL") {
            config.object_store_url = Some(url);
        }
        if let Ok(size) = std::env::var("CACHE_MAX_SIZE") {
            config.max_cache_size = parse_var("CACHE_MAX_SIZE", &size)?;
        }
        if let Ok(size) = std::env::var("CACHE_MAX_ENTRY_SIZE") {
            config.max_entry_size = parse_var("CACHE_MAX_ENTRY_SIZE", &size)?;
        }
        if let Ok(ttl) = std::env::var("CACHE_DEFAULT_TTL_SECONDS") {
            config.default_ttl_seconds = parse_var("CACHE_DEFAULT_TTL_SECONDS", &ttl)?;
        }
        if let Ok(period) = std::env::var("CACHE_CLEANUP_PERIOD_SECONDS") {
            config.cleanup_period_seconds = parse_var("CACHE_CLEANUP_PERIOD_SECONDS", &period)?;
        }
        if let Ok(auth) = std::env::var("CACHE_AUTHENTICATION") {
            config.authentication = auth == "1" || auth.eq_ignore_ascii_case("true");
        }
        if let Ok(token) = std::env::var("CACHE_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::Invalid("max_cache_size must be positive".to_string()));
        }
        if self.max_entry_size == 0 {
            return Err(ConfigError::Invalid("max_entry_size must be positive".to_string()));
        }
        if self.cleanup_period_seconds == 0 {
            return Err(ConfigError::Invalid(
                "cleanup_period_seconds must be positive".to_string(),
            ));
        }
        if self.storage_type == StorageType::ObjectStore && self.object_store_url.is_none() {
            return Err(ConfigError::Invalid(
                "object-store storage requires object_store_url".to_string(),
            ));
        }
        if self.authentication && self.auth_token.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Invalid(
                "authentication requires a non-empty auth_token".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            max_cache_size: self.max_cache_size,
            max_entry_size: self.max_entry_size,
            default_ttl_seconds: self.default_ttl_seconds,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} has invalid value {value:?}")))
}
