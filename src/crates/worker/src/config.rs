//! Worker configuration
//!
//! JSON file as the single positional argument, or `WORKER_*` /
//! `COORDINATOR_ADDRESS` environment variables when absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
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

/// Build worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// host:port of the coordinator's RPC listener
    pub coordinator_address: String,
    pub rpc_port: u16,
    /// Address the coordinator should dial back; defaults to
    /// `127.0.0.1:<rpc_port>` for single-host setups
    pub advertised_address: Option<String>,
    /// Root under which per-build scratch directories are created
    pub build_dir: PathBuf,
    pub cache_enabled: bool,
    /// Remote cache server base URL; embedded filesystem cache when unset
    pub cache_address: Option<String>,
    /// Directory for the embedded cache; defaults to `<build_dir>/cache`
    pub cache_dir: Option<PathBuf>,
    pub max_cache_size: u64,
    pub capabilities: Vec<String>,
    pub max_concurrent_builds: u32,
    pub build_timeout_seconds: u64,
    /// External build tool binary
    pub build_tool_path: String,
    pub heartbeat_period_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            coordinator_address: "127.0.0.1:7070".to_string(),
            rpc_port: 7071,
            advertised_address: None,
            build_dir: PathBuf::from("/var/lib/gantry/builds"),
            cache_enabled: true,
            cache_address: None,
            cache_dir: None,
            max_cache_size: 5 * 1024 * 1024 * 1024,
            capabilities: vec!["gradle".to_string(), "java".to_string()],
            max_concurrent_builds: 2,
            build_timeout_seconds: 1800, // 30 minutes
            build_tool_path: "gradle".to_string(),
            heartbeat_period_seconds: 30,
        }
    }
}

impl WorkerConfig {
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
        if let Ok(id) = std::env::var("WORKER_ID") {
            config.worker_id = id;
        }
        if let Ok(addr) = std::env::var("COORDINATOR_ADDRESS") {
            config.coordinator_address = addr;
        }
        if let Ok(port) = std::env::var("WORKER_RPC_PORT") {
            config.rpc_port = parse_var("WORKER_RPC_PORT", &port)?;
        }
        if let Ok(addr) = std::env::var("WORKER_ADVERTISED_ADDRESS") {
            config.advertised_address = Some(addr);
        }
        if let Ok(dir) = std::env::var("WORKER_BUILD_DIR") {
            config.build_dir = PathBuf::from(dir);
        }
        if let Ok(enabled) = std::env::var("WORKER_CACHE_ENABLED") {
            config.cache_enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        }
        if let Ok(addr) = std::env::var("WORKER_CACHE_ADDRESS") {
            config.cache_address = Some(addr);
        }
        if let Ok(caps) = std::env::var("WORKER_CAPABILITIES") {
            config.capabilities = caps.split(',').map(|c| c.trim().to_string()).collect();
        }
        if let Ok(max) = std::env::var("WORKER_MAX_CONCURRENT_BUILDS") {
            config.max_concurrent_builds = parse_var("WORKER_MAX_CONCURRENT_BUILDS", &max)?;
        }
        if let Ok(timeout) = std::env::var("WORKER_BUILD_TIMEOUT_SECONDS") {
            config.build_timeout_seconds = parse_var("WORKER_BUILD_TIMEOUT_SECONDS", &timeout)?;
        }
        if let Ok(tool) = std::env::var("WORKER_BUILD_TOOL") {
            config.build_tool_path = tool;
        }
        if let Ok(period) = std::env::var("WORKER_HEARTBEAT_PERIOD_SECONDS") {
            config.heartbeat_period_seconds = parse_var("WORKER_HEARTBEAT_PERIOD_SECONDS", &period)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.is_empty() {
            return Err(ConfigError::Invalid("worker_id must not be empty".to_string()));
        }
        if self.coordinator_address.is_empty() {
            return Err(ConfigError::Invalid(
                "coordinator_address must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_builds == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_builds must be at least 1".to_string(),
            ));
        }
        if self.build_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "build_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.heartbeat_period_seconds == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_period_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Address workers advertise to the coordinator for dial-back.
    pub fn advertised_address(&self) -> String {
        self.advertised_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.rpc_port))
    }

    /// Directory backing the embedded cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.build_dir.join("cache"))
    }

    pub fn build_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.build_timeout_seconds)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} has invalid value {value:?}")))
}
