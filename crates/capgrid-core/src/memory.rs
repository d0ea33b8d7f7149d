//! In-process compute units and provider.
//!
//! `MemoryUnit` keeps its workload list behind a per-unit mutex, so every
//! operation is atomic with respect to the others. `MemoryProvider` hands
//! out `MemoryUnit`s and can simulate slow or failing provisioning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{UnitError, UnitResult};
use crate::provider::CapacityProvider;
use crate::types::{UnitId, WorkloadId};
use crate::unit::{ComputeUnit, SharedUnit};

/// Process-wide source of unit ids. Workload ids embed the unit id, which
/// keeps them unique across every unit ever created.
static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct UnitState {
    used: u64,
    /// Sequence number for the next workload id minted on this unit.
    next_seq: u64,
    /// (workload, size) in placement order.
    workloads: Vec<(WorkloadId, u64)>,
}

/// A compute unit whose bookkeeping lives entirely in memory.
#[derive(Debug)]
pub struct MemoryUnit {
    id: UnitId,
    capacity: u64,
    state: Mutex<UnitState>,
}

impl MemoryUnit {
    pub fn new(capacity: u64) -> Self {
        Self {
            id: UnitId::new(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)),
            capacity,
            state: Mutex::new(UnitState {
                next_seq: 1,
                ..UnitState::default()
            }),
        }
    }

    /// Capacity currently reserved by placed workloads.
    pub fn used_capacity(&self) -> u64 {
        self.state().used
    }

    fn state(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ComputeUnit for MemoryUnit {
    fn unit_id(&self) -> UnitId {
        self.id
    }

    fn total_capacity(&self) -> u64 {
        self.capacity
    }

    fn remaining_capacity(&self) -> u64 {
        self.capacity - self.state().used
    }

    fn placed_workloads(&self) -> Vec<WorkloadId> {
        self.state()
            .workloads
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn place(&self, size: u64) -> UnitResult<WorkloadId> {
        let mut state = self.state();
        let remaining = self.capacity - state.used;
        if size > remaining {
            return Err(UnitError::Capacity {
                requested: size,
                remaining,
            });
        }

        let id = WorkloadId::for_unit(self.id, state.next_seq);
        state.next_seq += 1;
        state.used += size;
        state.workloads.push((id.clone(), size));
        Ok(id)
    }

    fn unplace(&self, workload: &WorkloadId) -> UnitResult<()> {
        let mut state = self.state();
        let index = state
            .workloads
            .iter()
            .position(|(id, _)| id == workload)
            .ok_or_else(|| UnitError::UnknownWorkload(workload.clone()))?;

        let (_, size) = state.workloads.remove(index);
        state.used -= size;
        Ok(())
    }
}

/// A provider that creates [`MemoryUnit`]s on request.
///
/// Latency and failures can be injected to exercise callers' handling of
/// slow and unreliable provisioning.
pub struct MemoryProvider {
    unit_capacity: u64,
    units: Mutex<Vec<SharedUnit>>,
    /// Total `request_unit` calls, successful or not.
    requests: AtomicU64,
    /// Remaining number of requests that will fail.
    pending_failures: AtomicU32,
    /// Latency applied to every request without a scheduled one.
    latency: Duration,
    /// Per-request latencies, consumed in call order.
    latency_schedule: Mutex<VecDeque<Duration>>,
}

impl MemoryProvider {
    pub fn new(unit_capacity: u64) -> Self {
        Self {
            unit_capacity,
            units: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
            pending_failures: AtomicU32::new(0),
            latency: Duration::ZERO,
            latency_schedule: Mutex::new(VecDeque::new()),
        }
    }

    /// Block every request for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Block the first requests for the given latencies, in call order.
    /// Later requests fall back to the uniform latency.
    pub fn with_latency_schedule(self, schedule: impl IntoIterator<Item = Duration>) -> Self {
        self.latency_schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(schedule);
        self
    }

    /// Make the next `count` requests fail.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of `request_unit` calls so far, including failed ones.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of units actually handed out.
    pub fn unit_count(&self) -> usize {
        self.units().len()
    }

    fn units(&self) -> MutexGuard<'_, Vec<SharedUnit>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_latency(&self) -> Duration {
        self.latency_schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.latency)
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CapacityProvider for MemoryProvider {
    fn request_unit(&self) -> anyhow::Result<SharedUnit> {
        let request = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = self.next_latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        if self.take_failure() {
            warn!(request, "simulated provider failure");
            anyhow::bail!("simulated provider failure on request {request}");
        }

        let unit: SharedUnit = Arc::new(MemoryUnit::new(self.unit_capacity));
        debug!(
            request,
            unit = %unit.unit_id(),
            capacity = self.unit_capacity,
            ?latency,
            "provisioned unit"
        );
        self.units().push(Arc::clone(&unit));
        Ok(unit)
    }

    fn all_units(&self) -> Vec<SharedUnit> {
        self.units().clone()
    }
}
