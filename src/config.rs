//! Engine configuration
//!
//! Every field has a serde default, so a partial JSON document (or `{}`)
//! is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::{log_event_with_fields, Event};

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The document is not a valid configuration
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values parse but cannot work together
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "AGG_CONFIG_IO",
            ConfigError::Parse(_) => "AGG_CONFIG_PARSE",
            ConfigError::Invalid(_) => "AGG_CONFIG_INVALID",
        }
    }
}

/// Compilation and execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global cap on rows accumulated by one term iteration (default: 1_000_000)
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,

    /// Worker threads for per-dataset fan-out, 0 for the rayon default
    #[serde(default)]
    pub parallelism: usize,

    /// Merge adjacent where-clause queries (default: true)
    #[serde(default = "default_true")]
    pub coalesce_actions: bool,

    /// Fuse a trailing explode and the final stats into one pass (default: true)
    #[serde(default = "default_true")]
    pub optimize_last_iterate: bool,

    /// Always request sorted term iteration (default: false)
    #[serde(default)]
    pub force_sorted_iteration: bool,

    /// Terms retained per group by bootstrap computations (default: 100_000)
    #[serde(default = "default_max_bootstrap_entries")]
    pub max_bootstrap_entries: usize,
}

fn default_row_limit() -> usize {
    1_000_000
}

fn default_true() -> bool {
    true
}

fn default_max_bootstrap_entries() -> usize {
    100_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            row_limit: default_row_limit(),
            parallelism: 0,
            coalesce_actions: true,
            optimize_last_iterate: true,
            force_sorted_iteration: false,
            max_bootstrap_entries: default_max_bootstrap_entries(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("row_limit", &config.row_limit.to_string()),
            ],
        );
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.row_limit == 0 {
            return Err(ConfigError::Invalid("row_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn with_row_limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = threads;
        self
    }

    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_actions = enabled;
        self
    }

    pub fn with_last_iterate_optimization(mut self, enabled: bool) -> Self {
        self.optimize_last_iterate = enabled;
        self
    }

    pub fn with_forced_sorting(mut self, enabled: bool) -> Self {
        self.force_sorted_iteration = enabled;
        self
    }

    pub fn with_max_bootstrap_entries(mut self, entries: usize) -> Self {
        self.max_bootstrap_entries = entries;
        self
    }
}
