//! Configuration for the page-store pipeline
//!
//! Handles loading and validation of `pagestore.toml` files. Every field has
//! a default, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [pipeline]
//! request_buffer = true
//! asynchronous = true
//! async_capacity = 100
//! worker_name_prefix = "page-store"
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Store pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Which layers wrap the persistent store, and how they are sized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Buffer added pages until the end of the request
    #[serde(default = "default_true")]
    pub request_buffer: bool,

    /// Store pages on background workers
    #[serde(default = "default_true")]
    pub asynchronous: bool,

    /// Maximum number of queued pages across all sessions
    #[serde(default = "default_async_capacity")]
    pub async_capacity: usize,

    /// Worker threads are named `<prefix>-<session id>`
    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_buffer: true,
            asynchronous: true,
            async_capacity: default_async_capacity(),
            worker_name_prefix: default_worker_name_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_async_capacity() -> usize {
    100
}

fn default_worker_name_prefix() -> String {
    crate::store::asynchronous::DEFAULT_WORKER_PREFIX.to_string()
}

impl Config {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load(path: &Path) -> crate::Result<Self> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display).into());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging
            .level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::ValidationError)?;

        let pipeline = &self.pipeline;
        if pipeline.asynchronous && pipeline.async_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.async_capacity must be at least 1 when pipeline.asynchronous is enabled"
                    .to_string(),
            ));
        }
        if pipeline.worker_name_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "pipeline.worker_name_prefix must not be empty".to_string(),
            ));
        }
        if pipeline.worker_name_prefix.contains('\0') {
            return Err(ConfigError::ValidationError(
                "pipeline.worker_name_prefix must not contain NUL".to_string(),
            ));
        }
        Ok(())
    }
}
