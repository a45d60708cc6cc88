//! Named-limiter configuration registry.
//!
//! Callers normally supply a [`RateLimitConfig`] per operation; deployments
//! that prefer central configuration can load a name-to-limiter table from
//! YAML and register it on the service instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::RateLimitConfig;

/// A table of named limiter configurations.
///
/// ```yaml
/// limits:
///   sendMessage:
///     kind: token_bucket
///     rate: 10
///     period_ms: 60000
///     shards: 4
///   resetPin:
///     kind: fixed_window
///     rate: 3
///     period_ms: 3600000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Map of limiter name to configuration.
    #[serde(default)]
    pub limits: HashMap<String, RateLimitConfig>,
}

impl LimitsConfig {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a registry from a YAML string. Every entry is validated up
    /// front so a bad limiter fails at load time, not at first use.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitsConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limits config: {e}")))?;

        for (name, limit) in &config.limits {
            limit
                .resolve()
                .map_err(|e| FloodgateError::Config(format!("invalid limiter {name:?}: {e}")))?;
        }

        Ok(config)
    }

    /// Get the configuration for a limiter name.
    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.limits.get(name)
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}
