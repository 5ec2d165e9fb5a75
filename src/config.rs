//! Configuration management for slidewin.
//!
//! Settings are layered, lowest precedence first: built-in defaults, an
//! optional YAML file, then `SLIDEWIN_`-prefixed environment variables
//! (`SLIDEWIN_LIMITER__CAPACITY=10`). Command-line flags are applied on top
//! by the binary.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SlidewinError};
use crate::ratelimit::SlidingWindowLimiter;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "SLIDEWIN";

/// Main configuration for slidewin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidewinConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Maximum requests per window
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            capacity: default_capacity(),
        }
    }
}

fn default_window_secs() -> u64 {
    30
}

fn default_capacity() -> usize {
    3
}

impl LimiterConfig {
    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Build a limiter from this configuration.
    pub fn build<K>(&self) -> Result<SlidingWindowLimiter<K>>
    where
        K: Eq + Hash + Clone + std::fmt::Debug,
    {
        SlidingWindowLimiter::new(self.window(), self.capacity)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log line format
    #[serde(default)]
    pub format: Format,
}

/// Output format for logs and replay decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Json,
}

impl SlidewinConfig {
    /// Load configuration from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load configuration, reading environment overrides from `env` instead
    /// of the process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: SlidewinConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SlidewinError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
