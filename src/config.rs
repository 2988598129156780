//! Coordinator configuration
//!
//! Settings can be built in code or loaded from a JSON file. The default file
//! lives in the XDG config directory (`~/.config/listingsync/config.json` on
//! Linux); a missing file means defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default time-to-live for cached query results (5 minutes)
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Name of the config file inside the config directory
const CONFIG_FILE_NAME: &str = "config.json";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for `CoordinatorConfig`
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for a `Coordinator` instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a cached result stays valid
    ///
    /// Stored in the file as `ttl_secs`, which may be fractional (`0.5`).
    #[serde(rename = "ttl_secs", with = "fractional_secs")]
    pub ttl: Duration,
    /// Optional upper bound on cached entries (LRU eviction when reached)
    pub max_entries: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache TTL. Sub-second values are kept as given.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Bound the cache to at most `max` entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the default config file path, if a home directory is known
    pub fn default_path() -> Option<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "listingsync")?;
        Some(project_dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a JSON file
    ///
    /// # Returns
    /// * `Ok(CoordinatorConfig)` with file values, defaults for absent fields
    /// * `Err(ConfigError)` if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads configuration from `path`, falling back to defaults when the file
    /// does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from the default location
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Serializes a `Duration` as (possibly fractional) seconds
mod fractional_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if ttl.subsec_nanos() == 0 {
            serializer.serialize_u64(ttl.as_secs())
        } else {
            serializer.serialize_f64(ttl.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|e| D::Error::custom(format!("invalid ttl_secs {secs}: {e}")))
    }
}
