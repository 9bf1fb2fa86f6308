//! WAL configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SEGLOG_CONFIG)
//! 3. Environment variables

use crate::error::ConfigError;
use crate::{DEFAULT_MAX_SEGMENTS, DEFAULT_SEGMENT_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// WAL configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory to store WAL segments.
    pub dir: PathBuf,
    /// Whether flushes also force a physical sync.
    pub fsync: bool,
    /// Segment size in bytes at which the log rotates.
    pub segment_size: u64,
    /// Maximum number of segment files kept on disk.
    pub max_segments: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./wal"),
            fsync: true,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
        }
    }
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_max_segments(mut self, count: usize) -> Self {
        self.max_segments = count;
        self
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SEGLOG_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SEGLOG_DIR") {
            self.dir = PathBuf::from(dir);
        }

        if let Ok(fsync) = std::env::var("SEGLOG_FSYNC") {
            self.fsync = fsync == "1" || fsync.to_lowercase() == "true";
        }

        if let Ok(size) = std::env::var("SEGLOG_SEGMENT_SIZE") {
            if let Ok(bytes) = size.parse() {
                self.segment_size = bytes;
            }
        }

        if let Ok(max) = std::env::var("SEGLOG_MAX_SEGMENTS") {
            if let Ok(n) = max.parse() {
                self.max_segments = n;
            }
        }
    }

    /// Checks the values a WAL cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size == 0 {
            return Err(ConfigError::ValidationError(
                "segment_size must be greater than zero".to_string(),
            ));
        }
        if self.max_segments == 0 {
            return Err(ConfigError::ValidationError(
                "max_segments must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
