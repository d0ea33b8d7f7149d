//! Rebuild coordinator bookkeeping from the provider's existing units.
//!
//! A coordinator started against a provider that already handed out units
//! (for example after a restart) lists them and reads back what each unit
//! hosts. Workload ids come straight from the units, so no container
//! boundaries are inferred from used capacity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use capgrid_core::{CapacityProvider, CoordinatorConfig, SharedUnit, UnitId, WorkloadId};

use crate::packer::slots_available;

/// Index and free pool reconstructed from a provider listing.
#[derive(Default)]
pub struct RecoveredState {
    pub index: HashMap<WorkloadId, SharedUnit>,
    pub free: BTreeMap<UnitId, SharedUnit>,
    pub units: usize,
}

/// List every unit the provider knows and rebuild the workload index and
/// the free pool from their current contents.
pub fn rebuild(provider: &dyn CapacityProvider, config: &CoordinatorConfig) -> RecoveredState {
    let mut units = provider.all_units();
    units.sort_by_key(|u| u.unit_id());

    let mut recovered = RecoveredState {
        units: units.len(),
        ..RecoveredState::default()
    };

    for unit in units {
        let unit_id = unit.unit_id();
        if unit.total_capacity() != config.instance_capacity {
            warn!(
                unit = %unit_id,
                capacity = unit.total_capacity(),
                expected = config.instance_capacity,
                "recovered unit has unexpected capacity"
            );
        }

        let workloads = unit.placed_workloads();
        for workload in &workloads {
            if let Some(previous) = recovered.index.get(workload) {
                warn!(
                    %workload,
                    unit = %unit_id,
                    first_unit = %previous.unit_id(),
                    "workload reported by two units, keeping the first"
                );
                continue;
            }
            recovered.index.insert(workload.clone(), Arc::clone(&unit));
        }

        let slots = slots_available(unit.remaining_capacity(), config.container_size);
        debug!(unit = %unit_id, workloads = workloads.len(), slots, "recovered unit");
        if slots > 0 {
            recovered.free.insert(unit_id, unit);
        }
    }

    if recovered.units > 0 {
        info!(
            units = recovered.units,
            workloads = recovered.index.len(),
            free_units = recovered.free.len(),
            "recovered placement state from provider"
        );
    }
    recovered
}
