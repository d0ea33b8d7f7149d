//! Placement coordinator — bin-packs containers onto provider units.
//!
//! The coordinator owns two pieces of bookkeeping: the index from workload
//! to hosting unit, and the free pool of units with room for at least one
//! more container. Both live behind one `std::sync::Mutex`, which is only
//! ever held for in-memory work and short unit calls. Provider requests
//! run with the lock released, so a `place` call blocked on slow
//! provisioning never stalls `locate`, `unplace` or other placements.
//!
//! # Placement
//!
//! ```text
//! loop:
//!     drain free pool (oldest unit first) until count is met
//!     if met: return
//!     if in-flight rounds promise enough unclaimed spare slots:
//!         claim them, wait for capacity to change, retry
//!     else:
//!         request ceil(shortfall / slots_per_unit) units in parallel
//!         fill each unit as it arrives, pool the leftovers
//!         on failed requests: back off, or give up past the limit
//! ```
//!
//! Concurrent `place` calls coalesce: a call whose shortfall fits in the
//! spare room of another call's in-flight units waits for those units
//! instead of requesting its own.
//!
//! A `place` future dropped mid-round hands its outstanding provider
//! requests to a background task, which pools each unit as it arrives.

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use capgrid_core::{CapacityProvider, CoordinatorConfig, SharedUnit, UnitId, WorkloadId};

use crate::error::{PlacementError, PlacementResult};
use crate::fanout::FanOut;
use crate::packer::{fill_unit, slots_available, units_needed};
use crate::recovery;
use crate::snapshot::{PlacementSnapshot, UnitSnapshot};

type RoundId = u64;

/// Spare slots of in-flight rounds reserved by one waiting `place` call.
type Claim = Vec<(RoundId, u64)>;

/// A provisioning round whose units have not all arrived yet.
#[derive(Debug)]
struct Round {
    pending_units: u64,
    /// Containers the round's owner still needs.
    owner_shortfall: u64,
    /// Slots promised to waiting `place` calls.
    claimed: u64,
}

impl Round {
    /// Slots this round will bring that nobody has spoken for.
    fn spare(&self, slots_per_unit: u64) -> u64 {
        self.pending_units
            .saturating_mul(slots_per_unit)
            .saturating_sub(self.owner_shortfall)
            .saturating_sub(self.claimed)
    }
}

#[derive(Default)]
struct State {
    index: HashMap<WorkloadId, SharedUnit>,
    /// Units with room for at least one more container, keyed by id so
    /// that insertion is idempotent and draining favors older units.
    free: BTreeMap<UnitId, SharedUnit>,
    rounds: HashMap<RoundId, Round>,
    next_round: RoundId,
}

impl State {
    fn record(&mut self, unit: &SharedUnit, ids: Vec<WorkloadId>, placed: &mut Vec<WorkloadId>) {
        for id in ids {
            self.index.insert(id.clone(), Arc::clone(unit));
            placed.push(id);
        }
    }

    fn open_round(&mut self, units: u64, owner_shortfall: u64) -> RoundId {
        let id = self.next_round;
        self.next_round += 1;
        self.rounds.insert(
            id,
            Round {
                pending_units: units,
                owner_shortfall,
                claimed: 0,
            },
        );
        id
    }

    /// Reserve `need` spare slots across in-flight rounds, or nothing if
    /// they cannot cover all of it.
    fn claim_in_flight(&mut self, need: u64, slots_per_unit: u64) -> Option<Claim> {
        let spare = self
            .rounds
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.spare(slots_per_unit)));
        if need == 0 || spare < need {
            return None;
        }

        let mut ids: Vec<RoundId> = self.rounds.keys().copied().collect();
        ids.sort_unstable();

        let mut claim = Vec::new();
        let mut left = need;
        for id in ids {
            if left == 0 {
                break;
            }
            let Some(round) = self.rounds.get_mut(&id) else {
                continue;
            };
            let take = round.spare(slots_per_unit).min(left);
            if take > 0 {
                round.claimed += take;
                left -= take;
                claim.push((id, take));
            }
        }
        Some(claim)
    }

    fn release_claim(&mut self, claim: Claim) {
        for (id, slots) in claim {
            if let Some(round) = self.rounds.get_mut(&id) {
                round.claimed = round.claimed.saturating_sub(slots);
            }
        }
    }
}

/// What a `place` call does after draining the free pool.
enum Step {
    Done,
    Wait(Claim),
    Provision { round: RoundId, units: u64 },
}

#[derive(Debug, Default)]
struct RoundOutcome {
    failures: u32,
    last_error: Option<String>,
}

/// Bookkeeping shared with rounds that outlive their `place` call.
struct Shared {
    state: Mutex<State>,
    /// Signalled when free capacity may have appeared or a round ended.
    capacity_changed: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_round(&self, round: RoundId) {
        self.state().rounds.remove(&round);
        self.capacity_changed.notify_waiters();
    }
}

/// Owns a round's provider requests and ends the round however `place`
/// exits. Requests still outstanding on drop are handed to [`pool_late_units`].
struct RoundGuard {
    shared: Arc<Shared>,
    round: RoundId,
    fanout: FanOut,
    container_size: u64,
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        let in_flight = self.fanout.in_flight();
        if in_flight == 0 {
            self.shared.end_round(self.round);
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(round = self.round, in_flight, "no runtime to collect late units");
            self.shared.end_round(self.round);
            return;
        };

        // The owner is gone, so every slot the round brings is spare.
        if let Some(r) = self.shared.state().rounds.get_mut(&self.round) {
            r.owner_shortfall = 0;
        }
        warn!(
            round = self.round,
            in_flight,
            "placement dropped mid-round, pooling late units"
        );
        runtime.spawn(pool_late_units(
            Arc::clone(&self.shared),
            self.round,
            std::mem::replace(&mut self.fanout, FanOut::empty()),
            self.container_size,
        ));
        self.shared.capacity_changed.notify_waiters();
    }
}

/// Put every unit from an abandoned round into the free pool as it arrives.
async fn pool_late_units(
    shared: Arc<Shared>,
    round: RoundId,
    mut fanout: FanOut,
    container_size: u64,
) {
    while let Some(result) = fanout.next().await {
        {
            let mut state = shared.state();
            if let Some(r) = state.rounds.get_mut(&round) {
                r.pending_units = r.pending_units.saturating_sub(1);
            }
            match result {
                Ok(unit) => {
                    let unit_id = unit.unit_id();
                    if slots_available(unit.remaining_capacity(), container_size) > 0 {
                        state.free.insert(unit_id, unit);
                    }
                    debug!(round, unit = %unit_id, "pooled late unit");
                }
                Err(e) => warn!(round, error = %e, "late provider request failed"),
            }
        }
        shared.capacity_changed.notify_waiters();
    }
    shared.end_round(round);
}

/// Places fixed-size containers onto fixed-size units from a provider.
///
/// All operations are safe to call concurrently through a shared
/// reference (typically an `Arc<PlacementCoordinator>`).
pub struct PlacementCoordinator {
    provider: Arc<dyn CapacityProvider>,
    config: CoordinatorConfig,
    shared: Arc<Shared>,
}

impl PlacementCoordinator {
    /// Create a coordinator over `provider`.
    ///
    /// Validates `config`, then adopts every unit the provider already
    /// lists: their workloads become locatable and units with room join
    /// the free pool.
    pub fn new(
        provider: Arc<dyn CapacityProvider>,
        config: CoordinatorConfig,
    ) -> PlacementResult<Self> {
        config.validate()?;
        let recovered = recovery::rebuild(provider.as_ref(), &config);

        Ok(Self {
            provider,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    index: recovered.index,
                    free: recovered.free,
                    ..State::default()
                }),
                capacity_changed: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn CapacityProvider> {
        &self.provider
    }

    /// Place `count` containers and return their ids.
    ///
    /// Returns only once every container is placed. Free units are used
    /// before any new unit is requested. If provider requests keep failing
    /// past `provisioning.max_failed_requests`, fails with
    /// [`PlacementError::Provisioning`]; containers placed so far by this
    /// call stay placed and are listed in the error.
    ///
    /// Dropping the returned future abandons the call, but not its units:
    /// containers already placed stay placed, and units still being
    /// provisioned join the free pool when they arrive.
    pub async fn place(&self, count: usize) -> PlacementResult<Vec<WorkloadId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let slots_per_unit = self.config.slots_per_unit();
        let max_failures = self.config.provisioning.max_failed_requests;
        let mut placed = Vec::new();
        let mut claim: Option<Claim> = None;
        let mut failures: u32 = 0;
        let mut rounds: u32 = 0;

        loop {
            let mut notified = pin!(self.shared.capacity_changed.notified());

            let step = {
                let mut state = self.state();
                if let Some(claim) = claim.take() {
                    state.release_claim(claim);
                }
                self.drain_free_pool(&mut state, count, &mut placed);

                let shortfall = (count - placed.len()) as u64;
                if shortfall == 0 {
                    Step::Done
                } else if let Some(claim) = state.claim_in_flight(shortfall, slots_per_unit) {
                    // Register before unlocking so no wake-up is missed.
                    notified.as_mut().enable();
                    Step::Wait(claim)
                } else {
                    let units = units_needed(shortfall, slots_per_unit);
                    Step::Provision {
                        round: state.open_round(units, shortfall),
                        units,
                    }
                }
            };

            match step {
                Step::Done => break,
                Step::Wait(reserved) => {
                    debug!(
                        shortfall = count - placed.len(),
                        rounds = reserved.len(),
                        "waiting on in-flight provisioning"
                    );
                    claim = Some(reserved);
                    notified.await;
                }
                Step::Provision { round, units } => {
                    rounds += 1;
                    let outcome = self.provision(round, units, count, &mut placed).await;
                    let Some(last_error) = outcome.last_error else {
                        continue;
                    };

                    failures += outcome.failures;
                    if placed.len() == count {
                        continue;
                    }
                    if failures > max_failures {
                        error!(
                            requested = count,
                            placed = placed.len(),
                            failures,
                            error = %last_error,
                            "giving up on provisioning"
                        );
                        return Err(PlacementError::Provisioning {
                            placed,
                            failures,
                            last_error,
                        });
                    }

                    let backoff = self.config.provisioning.retry_backoff();
                    warn!(
                        failures,
                        max_failures,
                        shortfall = count - placed.len(),
                        ?backoff,
                        "provider requests failed, retrying"
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        info!(count, rounds, failures, "placed containers");
        Ok(placed)
    }

    /// The unit currently hosting `workload`, as the provider issued it.
    pub fn locate(&self, workload: &WorkloadId) -> PlacementResult<SharedUnit> {
        self.state()
            .index
            .get(workload)
            .cloned()
            .ok_or_else(|| PlacementError::NotFound(workload.clone()))
    }

    /// Remove `workload` from its unit and return the unit to the free pool.
    pub fn unplace(&self, workload: &WorkloadId) -> PlacementResult<()> {
        let unit_id = {
            let mut state = self.state();
            let unit = state
                .index
                .remove(workload)
                .ok_or_else(|| PlacementError::NotFound(workload.clone()))?;

            if let Err(e) = unit.unplace(workload) {
                warn!(
                    %workload,
                    unit = %unit.unit_id(),
                    error = %e,
                    "unit no longer hosts workload, dropped stale entry"
                );
                return Err(e.into());
            }

            let unit_id = unit.unit_id();
            state.free.entry(unit_id).or_insert(unit);
            unit_id
        };

        debug!(%workload, unit = %unit_id, "unplaced workload");
        self.shared.capacity_changed.notify_waiters();
        Ok(())
    }

    /// Number of workloads currently tracked.
    pub fn placed_count(&self) -> usize {
        self.state().index.len()
    }

    /// Ids of units in the free pool, ascending.
    pub fn free_units(&self) -> Vec<UnitId> {
        self.state().free.keys().copied().collect()
    }

    pub fn snapshot(&self) -> PlacementSnapshot {
        let state = self.state();

        let mut units: BTreeMap<UnitId, &SharedUnit> = BTreeMap::new();
        for unit in state.index.values().chain(state.free.values()) {
            units.entry(unit.unit_id()).or_insert(unit);
        }

        PlacementSnapshot {
            units: units
                .into_iter()
                .map(|(unit_id, unit)| UnitSnapshot {
                    unit_id,
                    total_capacity: unit.total_capacity(),
                    remaining_capacity: unit.remaining_capacity(),
                    workloads: unit.placed_workloads(),
                })
                .collect(),
            free_units: state.free.keys().copied().collect(),
            placed: state.index.len(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state()
    }

    fn drain_free_pool(&self, state: &mut State, count: usize, placed: &mut Vec<WorkloadId>) {
        while placed.len() < count {
            let Some(unit) = state.free.values().next().cloned() else {
                break;
            };
            let unit_id = unit.unit_id();

            let want = (count - placed.len()) as u64;
            let fill = fill_unit(unit.as_ref(), self.config.container_size, want);
            debug!(unit = %unit_id, filled = fill.placed.len(), "filled unit from free pool");
            state.record(&unit, fill.placed, placed);

            if !fill.has_room {
                state.free.remove(&unit_id);
                debug!(unit = %unit_id, "unit full, left free pool");
            }
        }
    }

    /// Run one provisioning round: request `units` in parallel and fold each
    /// into the bookkeeping as it arrives.
    async fn provision(
        &self,
        round: RoundId,
        units: u64,
        count: usize,
        placed: &mut Vec<WorkloadId>,
    ) -> RoundOutcome {
        info!(
            round,
            units,
            shortfall = count - placed.len(),
            "requesting units from provider"
        );

        let mut guard = RoundGuard {
            shared: Arc::clone(&self.shared),
            round,
            fanout: FanOut::spawn(&self.provider, units as usize),
            container_size: self.config.container_size,
        };
        let mut outcome = RoundOutcome::default();

        while let Some(result) = guard.fanout.next().await {
            match result {
                Ok(unit) => self.integrate(round, unit, count, placed),
                Err(e) => {
                    warn!(round, error = %e, "provider request failed");
                    self.forget_pending_unit(round);
                    outcome.failures += 1;
                    outcome.last_error = Some(e.to_string());
                }
            }
            self.shared.capacity_changed.notify_waiters();
        }

        outcome
    }

    fn integrate(&self, round: RoundId, unit: SharedUnit, count: usize, placed: &mut Vec<WorkloadId>) {
        let mut state = self.state();
        let unit_id = unit.unit_id();

        let want = (count - placed.len()) as u64;
        let fill = fill_unit(unit.as_ref(), self.config.container_size, want);
        let filled = fill.placed.len();
        state.record(&unit, fill.placed, placed);

        if let Some(r) = state.rounds.get_mut(&round) {
            r.pending_units = r.pending_units.saturating_sub(1);
            r.owner_shortfall = (count - placed.len()) as u64;
        }
        if fill.has_room {
            state.free.insert(unit_id, unit);
        }

        debug!(
            round,
            unit = %unit_id,
            filled,
            pooled = fill.has_room,
            "integrated new unit"
        );
    }

    fn forget_pending_unit(&self, round: RoundId) {
        if let Some(r) = self.state().rounds.get_mut(&round) {
            r.pending_units = r.pending_units.saturating_sub(1);
        }
    }
}
