//! Minimal configuration loading for bucketry nodes.
//!
//! A node needs three things before it can join a mesh: the buckets it
//! serves, the peers it may forward to, and the port it listens on. All of
//! it is plain TOML with serde defaults, so a bare `[node]` table is a valid
//! configuration for a single-node deployment.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/bucketry/config.toml` (system)
//! 2. `~/.config/bucketry/config.toml` (user)
//! 3. `./bucketry.toml` (local override)
//! 4. Environment variables (`BUCKETRY_*`)
//!
//! # Example Config
//!
//! ```toml
//! [node]
//! server_port = "4770"
//! peers = ["10.0.0.2:4770", "10.0.0.3:4770"]
//! debug = false
//! log_level = "info"
//!
//! [buckets.mail]
//! life_span_ms = 2000
//! max_bucket = 64
//!
//! [buckets.billing]
//! life_span_ms = 10000
//! run_after_ms = 500
//! max_bucket = 16
//! verbose = true
//! ```

pub mod loader;

pub use loader::{discover_config_files, merge_configs, ConfigSources};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by every task in one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Milliseconds a task may live before it is declared exhausted.
    /// Default: 2000
    #[serde(default = "BucketSettings::default_life_span_ms")]
    pub life_span_ms: u64,

    /// Milliseconds a delayed task sleeps before its body runs.
    /// Default: 0
    #[serde(default)]
    pub run_after_ms: u64,

    /// Maximum number of concurrently held tasks. Must be >= 1.
    /// Default: 16
    #[serde(default = "BucketSettings::default_max_bucket")]
    pub max_bucket: usize,

    /// Emit per-task debug logging.
    #[serde(default)]
    pub verbose: bool,
}

impl BucketSettings {
    fn default_life_span_ms() -> u64 {
        2000
    }

    fn default_max_bucket() -> usize {
        16
    }

    pub fn life_span(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.life_span_ms)
    }

    pub fn run_after(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.run_after_ms)
    }
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            life_span_ms: Self::default_life_span_ms(),
            run_after_ms: 0,
            max_bucket: Self::default_max_bucket(),
            verbose: false,
        }
    }
}

/// Mesh membership and bind settings for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// TCP port the control-plane server binds.
    /// Default: "4770"
    #[serde(default = "NodeSettings::default_server_port")]
    pub server_port: String,

    /// `host:port` addresses of the other mesh members. The local address
    /// must not be listed; filter it out before constructing a group.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Emit connection-level debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Log level filter (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "NodeSettings::default_log_level")]
    pub log_level: String,
}

impl NodeSettings {
    fn default_server_port() -> String {
        "4770".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            server_port: Self::default_server_port(),
            peers: Vec::new(),
            debug: false,
            log_level: Self::default_log_level(),
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    /// Bucket name to settings. BTreeMap keeps dumps deterministic.
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketSettings>,
}

impl NodeConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting a CLI-supplied path replace the local
    /// override file.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = NodeConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, settings) in &self.buckets {
            if settings.max_bucket < 1 {
                return Err(ConfigError::Invalid(format!(
                    "bucket {name}: max_bucket must be >= 1"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = NodeConfig::default();
        assert_eq!(config.node.server_port, "4770");
        assert!(config.node.peers.is_empty());
        assert!(config.buckets.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_bucket_rejected() {
        let mut config = NodeConfig::default();
        config.buckets.insert(
            "mail".to_string(),
            BucketSettings {
                max_bucket: 0,
                ..Default::default()
            },
        );
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duration_accessors() {
        let settings = BucketSettings {
            life_span_ms: 2500,
            run_after_ms: 100,
            ..Default::default()
        };
        assert_eq!(settings.life_span(), std::time::Duration::from_millis(2500));
        assert_eq!(settings.run_after(), std::time::Duration::from_millis(100));
    }
}
