//! Configuration management for Tempo.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, TempoError};
use crate::ratelimit::LimiterConfig;

/// Prefix for environment variable overrides, e.g. `TEMPO__LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "TEMPO";

/// Main configuration for Tempo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TempoConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limiter configuration per upstream target
    #[serde(default)]
    pub upstreams: HashMap<String, LimiterConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TempoConfig {
    /// Load configuration from an optional YAML file layered with
    /// `TEMPO__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder
                .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let config: TempoConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TempoConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TempoError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every upstream's limiter configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, limiter) in &self.upstreams {
            limiter.validate().map_err(|e| match e {
                TempoError::Config(reason) => {
                    TempoError::Config(format!("upstream '{}': {}", name, reason))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Get the limiter configuration for an upstream.
    pub fn upstream(&self, name: &str) -> Option<&LimiterConfig> {
        self.upstreams.get(name)
    }
}
