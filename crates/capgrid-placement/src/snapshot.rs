//! Serializable view of a coordinator's placements.

use serde::{Deserialize, Serialize};

use capgrid_core::{UnitId, WorkloadId};

/// Point-in-time view of one unit known to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub unit_id: UnitId,
    pub total_capacity: u64,
    pub remaining_capacity: u64,
    /// Workloads the unit itself reports, in placement order.
    pub workloads: Vec<WorkloadId>,
}

/// Point-in-time view of everything the coordinator tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementSnapshot {
    /// Units hosting a tracked workload or sitting in the free pool, by id.
    pub units: Vec<UnitSnapshot>,
    /// Units in the free pool, by id.
    pub free_units: Vec<UnitId>,
    /// Workloads in the coordinator's index.
    pub placed: usize,
}

impl PlacementSnapshot {
    pub fn unit(&self, unit_id: UnitId) -> Option<&UnitSnapshot> {
        self.units.iter().find(|u| u.unit_id == unit_id)
    }

    /// Spare capacity summed over all units.
    pub fn total_remaining(&self) -> u64 {
        self.units.iter().map(|u| u.remaining_capacity).sum()
    }
}
