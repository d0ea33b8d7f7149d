//! Placement error types.

use thiserror::Error;

use capgrid_core::{ConfigError, UnitError, WorkloadId};

/// Errors surfaced by the placement coordinator.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("workload not found: {0}")]
    NotFound(WorkloadId),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    /// Too many provider requests failed during one `place` call. The
    /// workloads in `placed` stay placed and locatable.
    #[error("provisioning gave up after {failures} failed provider requests: {last_error}")]
    Provisioning {
        placed: Vec<WorkloadId>,
        failures: u32,
        last_error: String,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("unit error: {0}")]
    Unit(#[from] UnitError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
