//! The capacity-provider contract.

use crate::unit::SharedUnit;

/// External factory and registry of compute units.
///
/// Implementations must be safe under concurrent calls from many threads.
pub trait CapacityProvider: Send + Sync {
    /// Synchronously obtain a new unit.
    ///
    /// This call may block for minutes. Errors are treated as transient by
    /// callers; there is no documented failure mode.
    fn request_unit(&self) -> anyhow::Result<SharedUnit>;

    /// Snapshot of every unit this provider has handed out.
    fn all_units(&self) -> Vec<SharedUnit>;
}
