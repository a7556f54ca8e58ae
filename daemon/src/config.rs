/// Daemon configuration
use crate::errors::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskpack_core::RuntimeConfig;

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeSection,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP server port
    pub http_port: u16,
    /// Bound on update/cancel fan-outs, in seconds
    pub request_timeout_secs: u64,
    /// Enable metrics endpoint
    pub enable_metrics: bool,
    /// Metrics port
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_addr: "127.0.0.1".to_string(),
            http_port: 8080,
            request_timeout_secs: 10,
            enable_metrics: true,
            metrics_port: 9090,
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Provider base URL; every request is `admin` when unset
    pub provider_url: Option<String>,
    /// Userinfo call timeout in seconds
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            provider_url: None,
            timeout_secs: 5,
        }
    }
}

/// Persistent store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Maximum pool size
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: PathBuf::from("taskpack.db"),
            max_connections: 5,
        }
    }
}

/// Graph runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub kv_default_ttl_secs: u64,
    pub kv_sweep_interval_secs: u64,
    pub discovery_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    pub terminal_retry_attempts: u32,
    /// Graph files deployed at start and on reload
    pub graphs: Vec<PathBuf>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        RuntimeSection {
            kv_default_ttl_secs: 3600,
            kv_sweep_interval_secs: 60,
            discovery_interval_ms: 500,
            cancel_poll_interval_ms: 50,
            terminal_retry_attempts: 5,
            graphs: Vec::new(),
        }
    }
}

impl RuntimeSection {
    pub fn to_runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            kv_default_ttl: Duration::from_secs(self.kv_default_ttl_secs),
            kv_sweep_interval: Duration::from_secs(self.kv_sweep_interval_secs),
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            cancel_poll_interval: Duration::from_millis(self.cancel_poll_interval_ms),
            terminal_retry_attempts: self.terminal_retry_attempts,
            ..RuntimeConfig::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (`text` or `json`)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.server.enable_metrics && self.server.metrics_port == self.server.http_port {
            return Err(DaemonError::ConfigError(
                "metrics_port must differ from http_port".to_string(),
            ));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(DaemonError::ConfigError(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.auth.timeout_secs == 0 {
            return Err(DaemonError::ConfigError(
                "auth.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.auth.provider_url {
            url::Url::parse(url).map_err(|e| {
                DaemonError::ConfigError(format!("Invalid auth.provider_url {}: {}", url, e))
            })?;
        }

        if self.storage.max_connections == 0 {
            return Err(DaemonError::ConfigError(
                "storage.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.runtime.kv_default_ttl_secs == 0 {
            return Err(DaemonError::ConfigError(
                "runtime.kv_default_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if !(1..=300).contains(&self.runtime.kv_sweep_interval_secs) {
            return Err(DaemonError::ConfigError(
                "runtime.kv_sweep_interval_secs must be within 1..=300".to_string(),
            ));
        }

        if !(1..=1000).contains(&self.runtime.discovery_interval_ms) {
            return Err(DaemonError::ConfigError(
                "runtime.discovery_interval_ms must be within 1..=1000".to_string(),
            ));
        }

        if !(1..=100).contains(&self.runtime.cancel_poll_interval_ms) {
            return Err(DaemonError::ConfigError(
                "runtime.cancel_poll_interval_ms must be within 1..=100".to_string(),
            ));
        }

        if self.runtime.terminal_retry_attempts == 0 {
            return Err(DaemonError::ConfigError(
                "runtime.terminal_retry_attempts must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(DaemonError::ConfigError(format!(
                "logging.format must be text or json, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}
