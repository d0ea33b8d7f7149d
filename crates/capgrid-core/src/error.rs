//! Error types for compute units and configuration.

use thiserror::Error;

use crate::types::WorkloadId;

/// Result type alias for compute-unit operations.
pub type UnitResult<T> = Result<T, UnitError>;

/// Errors raised by a [`ComputeUnit`](crate::unit::ComputeUnit).
///
/// A failed operation leaves the unit exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("not enough capacity: requested {requested}, remaining {remaining}")]
    Capacity { requested: u64, remaining: u64 },

    #[error("workload not placed on this unit: {0}")]
    UnknownWorkload(WorkloadId),
}

/// Errors loading or validating a [`CoordinatorConfig`](crate::config::CoordinatorConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
