//! MeshMark server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default configuration constants
///
/// This module centralizes all default values used throughout MeshMark.
/// Collecting them in one place keeps the daemon, the drivers, and the
/// tests agreeing on the same operational policy.
pub mod defaults {

    // Network defaults
    /// Bind to an ephemeral port by default; the real endpoint is published
    /// through the address directory after binding.
    pub const fn default_bind_addr() -> &'static str {
        "0.0.0.0:0"
    }

    /// RPC timeout: 30 seconds
    pub const TIMEOUT_SECS: u64 = 30;

    /// Default directory file for rank address exchange
    pub const fn default_directory_file() -> &'static str {
        "/tmp/meshmark/directory"
    }

    /// Default directory for per-host proxy socket and address files
    pub const fn default_proxy_dir() -> &'static str {
        "/tmp/meshmark"
    }

    // Bootstrap defaults
    /// Directory load attempts before giving up on bootstrap
    pub const DIRECTORY_RETRIES: usize = 60;

    /// Interval between directory load attempts
    pub const DIRECTORY_RETRY_INTERVAL_MS: u64 = 2000;

    // Collective defaults
    /// Fan-out degree of the collective tree
    pub const TREE_DEGREE: u32 = 2;

    /// Concurrent inbound handler limit. Handlers block while waiting on
    /// child responses during a collective, so this must stay at or above
    /// the maximum fan-out degree to avoid pool-exhaustion deadlock.
    pub const POOL_SIZE: usize = 64;

    // Log level
    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// MeshMark server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Collective tree configuration
    #[serde(default)]
    pub collective: CollectiveConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server address to bind (IP:port, port 0 = ephemeral)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address directory file for rank address exchange.
    /// Must be on a filesystem shared by all nodes.
    #[serde(default = "default_directory_file")]
    pub directory_file: PathBuf,

    /// Directory holding the per-host proxy socket and its address file
    #[serde(default = "default_proxy_dir")]
    pub proxy_dir: PathBuf,

    /// RPC timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Directory load attempts before bootstrap fails
    #[serde(default = "default_directory_retries")]
    pub directory_retries: usize,

    /// Interval between directory load attempts in milliseconds
    #[serde(default = "default_directory_retry_interval_ms")]
    pub directory_retry_interval_ms: u64,
}

fn default_bind_addr() -> String {
    defaults::default_bind_addr().to_string()
}

fn default_directory_file() -> PathBuf {
    PathBuf::from(defaults::default_directory_file())
}

fn default_proxy_dir() -> PathBuf {
    PathBuf::from(defaults::default_proxy_dir())
}

fn default_timeout() -> u64 {
    defaults::TIMEOUT_SECS
}

fn default_directory_retries() -> usize {
    defaults::DIRECTORY_RETRIES
}

fn default_directory_retry_interval_ms() -> u64 {
    defaults::DIRECTORY_RETRY_INTERVAL_MS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            directory_file: default_directory_file(),
            proxy_dir: default_proxy_dir(),
            timeout_secs: default_timeout(),
            directory_retries: default_directory_retries(),
            directory_retry_interval_ms: default_directory_retry_interval_ms(),
        }
    }
}

/// Collective tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveConfig {
    /// Fan-out degree of the k-ary collective tree (k >= 1)
    #[serde(default = "default_tree_degree")]
    pub tree_degree: u32,

    /// Concurrent inbound handler limit
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_tree_degree() -> u32 {
    defaults::TREE_DEGREE
}

fn default_pool_size() -> usize {
    defaults::POOL_SIZE
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            tree_degree: default_tree_degree(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            collective: CollectiveConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: MeshConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.bind_addr.is_empty() {
            return Err(ConfigError::ValidationError(
                "Bind address cannot be empty".to_string(),
            ));
        }

        if self.collective.tree_degree < 1 {
            return Err(ConfigError::ValidationError(
                "Tree degree must be at least 1".to_string(),
            ));
        }

        // Handlers waiting on children hold pool permits; a pool smaller
        // than the fan-out can deadlock a nested collective.
        if self.collective.pool_size < self.collective.tree_degree as usize {
            return Err(ConfigError::ValidationError(format!(
                "Pool size {} must be at least the tree degree {}",
                self.collective.pool_size, self.collective.tree_degree
            )));
        }

        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.node.log_level
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.collective.tree_degree, 2);
        assert_eq!(config.network.timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = MeshConfig::default();

        config.collective.tree_degree = 0;
        assert!(config.validate().is_err());

        config.collective.tree_degree = 2;
        config.collective.pool_size = 1;
        assert!(config.validate().is_err());

        config.collective.pool_size = 64;
        config.node.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = MeshConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: MeshConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(
            config.network.bind_addr,
            deserialized.network.bind_addr
        );
        assert_eq!(
            config.collective.tree_degree,
            deserialized.collective.tree_degree
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            [collective]
            tree_degree = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.collective.tree_degree, 4);
        assert_eq!(config.network.timeout_secs, defaults::TIMEOUT_SECS);
        assert_eq!(config.node.log_level, "info");
    }
}
