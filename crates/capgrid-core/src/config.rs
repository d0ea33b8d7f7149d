//! Coordinator configuration, loadable from TOML.
//!
//! ```toml
//! instance_capacity = 10
//! container_size = 1
//!
//! [provisioning]
//! max_failed_requests = 3
//! retry_backoff_ms = 250
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fixed sizing for a placement coordinator. Immutable once the
/// coordinator is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Capacity of every unit the provider hands out.
    pub instance_capacity: u64,
    /// Capacity consumed by every container.
    pub container_size: u64,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

/// How a single `place` call reacts to failed provider requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Failed requests tolerated per `place` call before it gives up.
    pub max_failed_requests: u32,
    /// Pause before re-requesting after a round with failures.
    pub retry_backoff_ms: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_failed_requests: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl ProvisioningConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl CoordinatorConfig {
    pub fn new(instance_capacity: u64, container_size: u64) -> Self {
        Self {
            instance_capacity,
            container_size,
            provisioning: ProvisioningConfig::default(),
        }
    }

    pub fn with_provisioning(mut self, provisioning: ProvisioningConfig) -> Self {
        self.provisioning = provisioning;
        self
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject sizings under which no container could ever be placed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_capacity == 0 {
            return Err(ConfigError::Invalid(
                "instance_capacity must be greater than zero".to_string(),
            ));
        }
        if self.container_size == 0 {
            return Err(ConfigError::Invalid(
                "container_size must be greater than zero".to_string(),
            ));
        }
        if self.container_size > self.instance_capacity {
            return Err(ConfigError::Invalid(format!(
                "container_size ({}) exceeds instance_capacity ({})",
                self.container_size, self.instance_capacity
            )));
        }
        Ok(())
    }

    /// Containers that fit on one empty unit.
    pub fn slots_per_unit(&self) -> u64 {
        self.instance_capacity / self.container_size
    }
}
