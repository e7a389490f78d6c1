//! DRP Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./drp.yaml` (current directory - highest priority)
//! 2. `~/.drp.yaml` (home directory)
//! 3. `~/.config/drp/drp.yaml` (user config directory)
//! 4. `/etc/drp/drp.yaml` (system - lowest priority)
//!
//! Files are merged key by key: a later file only overrides the keys it
//! actually sets, so `node.handshake.hop_budget` in `./drp.yaml` keeps every
//! other `node.handshake.*` value from the system file.
//!
//! # YAML Structure
//!
//! ```yaml
//! node:
//!   identity:
//!     secret: "0102...1f20"
//!   handshake:
//!     hop_budget: 8
//! transport:
//!   udp:
//!     bind_addr: "0.0.0.0:4100"
//! ```

mod node;
mod transport;

use crate::identity::{Identity, IdentityError};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use node::{
    AdmissionConfig, BuffersConfig, HandshakeConfig, LimitsConfig, LivenessConfig, NodeConfig,
};
pub use transport::{TransportConfig, UdpConfig};

/// Default config filename.
const CONFIG_FILENAME: &str = "drp.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid merged configuration: {0}")]
    Invalid(serde_yaml::Error),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Identity configuration (`node.identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Ed25519 seed as 64 hex characters (`node.identity.secret`).
    /// If not specified, an ephemeral keypair is generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Transport configuration (`transport.*`).
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns a tuple of (config, paths_loaded) where paths_loaded contains
    /// the paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut merged = Value::Mapping(Default::default());
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let value = Self::read_value(path)?;
                merge_values(&mut merged, value);
                loaded_paths.push(path.clone());
            }
        }

        let config = serde_yaml::from_value(merged).map_err(ConfigError::Invalid)?;
        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = Self::read(path)?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn read(path: &Path) -> Result<String, ConfigError> {
        std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn read_value(path: &Path) -> Result<Value, ConfigError> {
        let contents = Self::read(path)?;
        let value: Value = serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        // An empty file parses as null
        Ok(match value {
            Value::Null => Value::Mapping(Default::default()),
            other => other,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/drp").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("drp").join(CONFIG_FILENAME));
        }

        // Home directory
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".drp.yaml"));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Create an Identity from this configuration.
    ///
    /// If a secret is configured, uses that to create the identity.
    /// Otherwise, generates a new random identity.
    pub fn create_identity(&self) -> Result<Identity, ConfigError> {
        match &self.node.identity.secret {
            Some(secret) => Ok(Identity::from_secret_hex(secret)?),
            None => Ok(Identity::generate()),
        }
    }

    /// Check if an identity is configured (vs. will be generated).
    pub fn has_identity(&self) -> bool {
        self.node.identity.secret.is_some()
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Recursively overlay `other` onto `base`. Mappings merge per key; any
/// other value replaces.
fn merge_values(base: &mut Value, other: Value) {
    match (base, other) {
        (Value::Mapping(base_map), Value::Mapping(other_map)) => {
            for (key, value) in other_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
