//! Coordinator configuration
//!
//! JSON file as the single positional argument, or `COORDINATOR_*`
//! environment variables when absent.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub http_port: u16,
    pub rpc_port: u16,
    /// Registry capacity; registrations beyond this are rejected
    pub max_workers: u32,
    /// Bounded FIFO admission queue
    pub queue_capacity: usize,
    /// How long terminal build records are retained
    pub build_retention_seconds: u64,
    pub heartbeat_period_seconds: u64,
    /// Dispatch attempts per build, counting the first
    pub max_attempts: u32,
    /// Per-build timeout workers enforce; also sizes the dispatch deadline
    pub build_timeout_seconds: u64,
    pub authentication: bool,
    pub auth_token: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            rpc_port: 7070,
            max_workers: 64,
            queue_capacity: 256,
            build_retention_seconds: 24 * 3600,
            heartbeat_period_seconds: 30,
            max_attempts: 3,
            build_timeout_seconds: 1800,
            authentication: false,
            auth_token: None,
        }
    }
}

impl CoordinatorConfig {
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

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("COORDINATOR_HTTP_PORT") {
            config.http_port = parse_var("COORDINATOR_HTTP_PORT", &port)?;
        }
        if let Ok(port) = std::env::var("COORDINATOR_RPC_PORT") {
            config.rpc_port = parse_var("COORDINATOR_RPC_PORT", &port)?;
        }
        if let Ok(max) = std::env::var("COORDINATOR_MAX_WORKERS") {
            config.max_workers = parse_var("COORDINATOR_MAX_WORKERS", &max)?;
        }
        if let Ok(capacity) = std::env::var("COORDINATOR_QUEUE_CAPACITY") {
            config.queue_capacity = parse_var("COORDINATOR_QUEUE_CAPACITY", &capacity)?;
        }
        if let Ok(retention) = std::env::var("COORDINATOR_BUILD_RETENTION_SECONDS") {
            config.build_retention_seconds =
                parse_var("COORDINATOR_BUILD_RETENTION_SECONDS", &retention)?;
        }
        if let Ok(period) = std::env::var("COORDINATOR_HEARTBEAT_PERIOD_SECONDS") {
            config.heartbeat_period_seconds =
                parse_var("COORDINATOR_HEARTBEAT_PERIOD_SECONDS", &period)?;
        }
        if let Ok(attempts) = std::env::var("COORDINATOR_MAX_ATTEMPTS") {
            config.max_attempts = parse_var("COORDINATOR_MAX_ATTEMPTS", &attempts)?;
        }
        if let Ok(timeout) = std::env::var("COORDINATOR_BUILD_TIMEOUT_SECONDS") {
            config.build_timeout_seconds =
                parse_var("COORDINATOR_BUILD_TIMEOUT_SECONDS", &timeout)?;
        }
        if let Ok(auth) = std::env::var("COORDINATOR_AUTHENTICATION") {
            config.authentication = auth == "1" || auth.eq_ignore_ascii_case("true");
        }
        if let Ok(token) = std::env::var("COORDINATOR_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if self.heartbeat_period_seconds == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_period_seconds must be positive".to_string(),
            ));
        }
        if self.authentication && self.auth_token.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Invalid(
                "authentication requires a non-empty auth_token".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_seconds)
    }

    /// A worker is fresh while its last heartbeat is within three periods.
    pub fn heartbeat_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(3 * self.heartbeat_period_seconds as i64)
    }

    /// Unreachable workers are dropped three further periods later.
    pub fn worker_removal_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(6 * self.heartbeat_period_seconds as i64)
    }

    /// Deadline for an ExecuteBuild RPC: build timeout plus slack.
    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_secs(self.build_timeout_seconds + 60)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} has invalid value {value:?}")))
}
