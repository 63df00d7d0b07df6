//! Config file discovery, loading, merging, and environment variable overlay.

use crate::{ConfigError, NodeConfig, NodeSettings};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/bucketry/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("bucketry/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("bucketry.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge two configs, with `overlay` taking precedence.
///
/// A node field wins when it differs from the compiled default, so a later
/// file that leaves a field unset does not clobber an earlier file's value.
/// Bucket tables merge per name; an overlay entry replaces the base entry
/// wholesale.
pub fn merge_configs(base: NodeConfig, overlay: NodeConfig) -> NodeConfig {
    let defaults = NodeSettings::default();
    let mut merged = NodeConfig {
        node: NodeSettings {
            server_port: if overlay.node.server_port != defaults.server_port {
                overlay.node.server_port
            } else {
                base.node.server_port
            },
            peers: if !overlay.node.peers.is_empty() {
                overlay.node.peers
            } else {
                base.node.peers
            },
            debug: if overlay.node.debug != defaults.debug {
                overlay.node.debug
            } else {
                base.node.debug
            },
            log_level: if overlay.node.log_level != defaults.log_level {
                overlay.node.log_level
            } else {
                base.node.log_level
            },
        },
        buckets: base.buckets,
    };
    merged.buckets.extend(overlay.buckets);
    merged
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut NodeConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("BUCKETRY_SERVER_PORT") {
        config.node.server_port = v;
        sources.env_overrides.push("BUCKETRY_SERVER_PORT".to_string());
    }
    // Comma-separated host:port list
    if let Ok(v) = env::var("BUCKETRY_PEERS") {
        config.node.peers = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        sources.env_overrides.push("BUCKETRY_PEERS".to_string());
    }
    if let Ok(v) = env::var("BUCKETRY_DEBUG") {
        config.node.debug = matches!(v.as_str(), "1" | "true" | "yes");
        sources.env_overrides.push("BUCKETRY_DEBUG".to_string());
    }
    if let Ok(v) = env::var("BUCKETRY_LOG_LEVEL") {
        config.node.log_level = v;
        sources.env_overrides.push("BUCKETRY_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.node.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
