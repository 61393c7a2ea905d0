//! Trailnet Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./trailnet.yaml` (current directory - highest priority)
//! 2. `~/.config/trailnet/trailnet.yaml` (user config directory)
//! 3. `/etc/trailnet/trailnet.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! routing:
//!   layers: 8
//!   trail_timeout_secs: 2520
//! ats:
//!   backoff_cap_secs: 900
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "trailnet.yaml";

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
}

// ============================================================================
// Routing Configuration
// ============================================================================

/// Default number of ring layers.
const DEFAULT_LAYERS: u16 = 8;

/// Default idle lifetime of a trail in seconds (42 minutes).
const DEFAULT_TRAIL_TIMEOUT_SECS: u64 = 42 * 60;

/// Default interval between random walks in seconds.
const DEFAULT_WALK_INTERVAL_SECS: u64 = 60;

/// Default number of finger slots per layer.
const DEFAULT_FINGERS_PER_LAYER: usize = 64;

/// Routing core configuration (`routing.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Number of independent ring layers (`routing.layers`). Defaults to 8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<u16>,

    /// Trail lifetime in seconds (`routing.trail_timeout_secs`).
    /// Defaults to 2520 (42 minutes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail_timeout_secs: Option<u64>,

    /// Interval between random walks in seconds
    /// (`routing.walk_interval_secs`). Defaults to 60.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk_interval_secs: Option<u64>,

    /// Finger slots per layer before the walk cycle wraps around
    /// (`routing.fingers_per_layer`). Defaults to 64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingers_per_layer: Option<usize>,
}

impl RoutingConfig {
    /// Get the layer count, using default if not configured.
    pub fn layers(&self) -> u16 {
        self.layers.unwrap_or(DEFAULT_LAYERS)
    }

    /// Get the trail lifetime in milliseconds.
    pub fn trail_timeout_ms(&self) -> u64 {
        self.trail_timeout_secs
            .unwrap_or(DEFAULT_TRAIL_TIMEOUT_SECS)
            .saturating_mul(1000)
    }

    /// Get the walk interval in milliseconds.
    pub fn walk_interval_ms(&self) -> u64 {
        self.walk_interval_secs
            .unwrap_or(DEFAULT_WALK_INTERVAL_SECS)
            .saturating_mul(1000)
    }

    /// Get the finger slot count per layer, using default if not configured.
    pub fn fingers_per_layer(&self) -> usize {
        self.fingers_per_layer.unwrap_or(DEFAULT_FINGERS_PER_LAYER)
    }
}

// ============================================================================
// Address Lifecycle Configuration
// ============================================================================

/// Default cap on the address suggestion backoff in seconds (15 minutes).
const DEFAULT_BACKOFF_CAP_SECS: u64 = 15 * 60;

/// Address lifecycle configuration (`ats.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtsConfig {
    /// Cap on the exponential re-suggestion backoff in seconds
    /// (`ats.backoff_cap_secs`). Defaults to 900 (15 minutes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_cap_secs: Option<u64>,
}

impl AtsConfig {
    /// Get the backoff cap in milliseconds.
    pub fn backoff_cap_ms(&self) -> u64 {
        self.backoff_cap_secs
            .unwrap_or(DEFAULT_BACKOFF_CAP_SECS)
            .saturating_mul(1000)
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Routing core configuration (`routing.*`).
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Address lifecycle configuration (`ats.*`).
    #[serde(default)]
    pub ats: AtsConfig,
}

impl Config {
    /// Create a new configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged:
    /// 1. `/etc/trailnet/trailnet.yaml` (loaded first, lowest priority)
    /// 2. `~/.config/trailnet/trailnet.yaml` (user config)
    /// 3. `./trailnet.yaml` (loaded last, highest priority)
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
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/trailnet").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("trailnet").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.routing.layers.is_some() {
            self.routing.layers = other.routing.layers;
        }
        if other.routing.trail_timeout_secs.is_some() {
            self.routing.trail_timeout_secs = other.routing.trail_timeout_secs;
        }
        if other.routing.walk_interval_secs.is_some() {
            self.routing.walk_interval_secs = other.routing.walk_interval_secs;
        }
        if other.routing.fingers_per_layer.is_some() {
            self.routing.fingers_per_layer = other.routing.fingers_per_layer;
        }
        if other.ats.backoff_cap_secs.is_some() {
            self.ats.backoff_cap_secs = other.ats.backoff_cap_secs;
        }
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
