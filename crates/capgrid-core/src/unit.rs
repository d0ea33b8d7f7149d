//! The compute-unit contract.

use std::fmt;
use std::sync::Arc;

use crate::error::UnitResult;
use crate::types::{UnitId, WorkloadId};

/// A reference-counted handle to a unit, exactly as the provider issued it.
pub type SharedUnit = Arc<dyn ComputeUnit>;

/// One elastic capacity unit obtained from a [`CapacityProvider`].
///
/// Every method must be safe to call concurrently. `place` and `unplace`
/// are all-or-nothing: on error the unit is left untouched. At every
/// observable point the used capacity equals the sum of the sizes of the
/// placed workloads and never exceeds [`total_capacity`](Self::total_capacity).
///
/// [`CapacityProvider`]: crate::provider::CapacityProvider
pub trait ComputeUnit: Send + Sync + fmt::Debug {
    /// Stable identity assigned by the provider.
    fn unit_id(&self) -> UnitId;

    /// Capacity fixed at creation.
    fn total_capacity(&self) -> u64;

    /// Point-in-time snapshot of unreserved capacity.
    fn remaining_capacity(&self) -> u64;

    /// Snapshot copy of the workloads currently hosted, in placement order.
    fn placed_workloads(&self) -> Vec<WorkloadId>;

    /// Reserve `size` capacity and mint a fresh, globally unique id.
    ///
    /// Fails with [`UnitError::Capacity`](crate::error::UnitError::Capacity)
    /// if `size` exceeds the remaining capacity.
    fn place(&self, size: u64) -> UnitResult<WorkloadId>;

    /// Release the capacity held by `workload`.
    ///
    /// Fails with [`UnitError::UnknownWorkload`](crate::error::UnitError::UnknownWorkload)
    /// if the workload is not hosted here.
    fn unplace(&self, workload: &WorkloadId) -> UnitResult<()>;
}
