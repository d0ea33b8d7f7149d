//! capgrid-core — shared types and collaborator contracts.
//!
//! Everything the placement coordinator consumes but does not own lives
//! here: identifiers, the [`ComputeUnit`] and [`CapacityProvider`]
//! contracts, the unit-level error taxonomy and the coordinator config.
//!
//! The [`memory`] module provides in-process implementations of both
//! contracts. They back the test suites and are usable as a simulated
//! provider when no real capacity backend is wired in.

pub mod config;
pub mod error;
pub mod memory;
pub mod provider;
pub mod types;
pub mod unit;

pub use config::{CoordinatorConfig, ProvisioningConfig};
pub use error::{ConfigError, UnitError, UnitResult};
pub use memory::{MemoryProvider, MemoryUnit};
pub use provider::CapacityProvider;
pub use types::{UnitId, WorkloadId};
pub use unit::{ComputeUnit, SharedUnit};
