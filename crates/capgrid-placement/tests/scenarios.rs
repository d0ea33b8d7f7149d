//! End-to-end placement scenarios against the in-memory provider.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use capgrid_core::{
    CapacityProvider, ComputeUnit, CoordinatorConfig, MemoryProvider, ProvisioningConfig,
    SharedUnit, UnitError, UnitId, UnitResult, WorkloadId,
};
use capgrid_placement::{PlacementCoordinator, PlacementError};

fn config(capacity: u64, size: u64) -> CoordinatorConfig {
    CoordinatorConfig::new(capacity, size).with_provisioning(ProvisioningConfig {
        max_failed_requests: 3,
        retry_backoff_ms: 0,
    })
}

fn setup(capacity: u64, size: u64) -> (Arc<MemoryProvider>, PlacementCoordinator) {
    let provider = Arc::new(MemoryProvider::new(capacity));
    let coordinator = PlacementCoordinator::new(provider.clone(), config(capacity, size)).unwrap();
    (provider, coordinator)
}

fn assert_distinct(ids: &[WorkloadId]) {
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "duplicate workload ids: {ids:?}");
}

/// Every tracked workload is reported by its unit, and every unit's used
/// capacity matches what it hosts.
fn assert_consistent(coordinator: &PlacementCoordinator, size: u64) {
    let snapshot = coordinator.snapshot();
    let mut hosted = 0;
    for unit in &snapshot.units {
        let used = unit.total_capacity - unit.remaining_capacity;
        assert_eq!(used, unit.workloads.len() as u64 * size);
        assert!(used <= unit.total_capacity);
        for id in &unit.workloads {
            let host = coordinator.locate(id).unwrap();
            assert_eq!(host.unit_id(), unit.unit_id);
        }
        hosted += unit.workloads.len();

        let has_room = unit.remaining_capacity >= size;
        assert_eq!(snapshot.free_units.contains(&unit.unit_id), has_room);
    }
    assert_eq!(hosted, snapshot.placed);
}

#[tokio::test]
async fn single_unit_filled_exactly() {
    let (provider, coordinator) = setup(3, 1);

    let ids = coordinator.place(3).await.unwrap();

    assert_eq!(provider.request_count(), 1);
    assert_eq!(ids.len(), 3);
    assert_distinct(&ids);
    let unit = coordinator.locate(&ids[0]).unwrap();
    assert_eq!(unit.remaining_capacity(), 0);
    assert!(coordinator.free_units().is_empty());
    assert_consistent(&coordinator, 1);
}

#[tokio::test]
async fn second_call_reuses_free_slots() {
    let (provider, coordinator) = setup(5, 1);

    coordinator.place(3).await.unwrap();
    coordinator.place(2).await.unwrap();

    assert_eq!(provider.request_count(), 1);
    assert!(coordinator.free_units().is_empty());
    assert_consistent(&coordinator, 1);
}

#[tokio::test]
async fn overflow_requests_a_second_unit() {
    let (provider, coordinator) = setup(5, 1);

    coordinator.place(3).await.unwrap();
    coordinator.place(3).await.unwrap();

    assert_eq!(provider.request_count(), 2);
    assert_eq!(coordinator.free_units().len(), 1);
    assert_consistent(&coordinator, 1);
}

#[tokio::test]
async fn unplaced_slot_is_reused() {
    let (provider, coordinator) = setup(5, 1);

    let ids = coordinator.place(3).await.unwrap();
    coordinator.unplace(&ids[0]).unwrap();
    coordinator.place(3).await.unwrap();

    assert_eq!(provider.request_count(), 1);
    assert_consistent(&coordinator, 1);
}

#[tokio::test]
async fn repeated_fill_and_drain_uses_one_unit() {
    let (provider, coordinator) = setup(5, 1);

    let mut ids = coordinator.place(5).await.unwrap();
    for _ in 0..10 {
        for id in &ids {
            coordinator.unplace(id).unwrap();
        }
        ids = coordinator.place(5).await.unwrap();
    }

    assert_eq!(provider.request_count(), 1);
    assert_eq!(coordinator.placed_count(), 5);
    assert_consistent(&coordinator, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_request_fans_out() {
    let (provider, coordinator) = setup(10, 1);

    let ids = coordinator.place(40).await.unwrap();

    assert_eq!(provider.request_count(), 4);
    assert_eq!(ids.len(), 40);
    assert_distinct(&ids);
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.units.len(), 4);
    assert!(snapshot.units.iter().all(|u| u.remaining_capacity == 0));
    assert_consistent(&coordinator, 1);
}

#[tokio::test]
async fn free_capacity_prevents_provisioning() {
    let (provider, coordinator) = setup(4, 2);

    // Two units, one free slot on each.
    let ids = coordinator.place(3).await.unwrap();
    coordinator.unplace(&ids[0]).unwrap();
    assert_eq!(provider.request_count(), 2);
    assert_eq!(coordinator.free_units().len(), 2);

    coordinator.place(2).await.unwrap();

    assert_eq!(provider.request_count(), 2);
    assert!(coordinator.free_units().is_empty());
    assert_consistent(&coordinator, 2);
}

#[tokio::test]
async fn unplace_restores_capacity() {
    let (_, coordinator) = setup(6, 2);

    coordinator.place(1).await.unwrap();
    let ids = coordinator.place(1).await.unwrap();
    let unit = coordinator.locate(&ids[0]).unwrap();
    let before = unit.remaining_capacity() + 2;

    coordinator.unplace(&ids[0]).unwrap();

    assert_eq!(unit.remaining_capacity(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_small_requests_share_one_unit() {
    let provider = Arc::new(MemoryProvider::new(5).with_latency(Duration::from_millis(300)));
    let coordinator =
        Arc::new(PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap());

    let handles: Vec<_> = [2usize, 2, 1]
        .into_iter()
        .map(|count| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.place(count).await })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap().unwrap());
    }

    assert_eq!(provider.request_count(), 1);
    assert_eq!(all.len(), 5);
    assert_distinct(&all);
    assert_consistent(&coordinator, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_concurrent_pairs_coalesce() {
    let provider = Arc::new(MemoryProvider::new(5).with_latency(Duration::from_millis(200)));
    let coordinator =
        Arc::new(PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap());

    let a = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.place(2).await }
    });
    let b = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.place(2).await }
    });

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(provider.request_count(), 1);
    let all: Vec<_> = a.into_iter().chain(b).collect();
    assert_distinct(&all);
    assert_eq!(coordinator.free_units().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_is_released_while_provisioning() {
    let provider = Arc::new(
        MemoryProvider::new(5).with_latency_schedule([Duration::ZERO, Duration::from_millis(800)]),
    );
    let coordinator =
        Arc::new(PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap());

    let ids = coordinator.place(5).await.unwrap();

    let slow = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.place(3).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    coordinator.locate(&ids[0]).unwrap();
    coordinator.unplace(&ids[1]).unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    let placed = slow.await.unwrap().unwrap();
    assert_eq!(placed.len(), 3);
    assert_eq!(provider.request_count(), 2);
    assert_consistent(&coordinator, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_concurrent_callers_get_distinct_locatable_ids() {
    let provider = Arc::new(MemoryProvider::new(7).with_latency(Duration::from_millis(20)));
    let coordinator =
        Arc::new(PlacementCoordinator::new(provider.clone(), config(7, 2)).unwrap());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.place(1 + i % 4).await })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap().unwrap());
    }

    let expected: usize = (0..16).map(|i| 1 + i % 4).sum();
    assert_eq!(all.len(), expected);
    assert_distinct(&all);
    for id in &all {
        let unit = coordinator.locate(id).unwrap();
        assert!(unit.placed_workloads().contains(id));
    }
    assert_consistent(&coordinator, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_place_and_unplace_stay_consistent() {
    let (_, coordinator) = setup(4, 1);
    let coordinator = Arc::new(coordinator);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                for _ in 0..10 {
                    let ids = coordinator.place(3).await.unwrap();
                    coordinator.unplace(&ids[1]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(coordinator.placed_count(), 8 * 10 * 2);
    assert_consistent(&coordinator, 1);
}

#[tokio::test]
async fn fresh_coordinator_recovers_placements() {
    let provider = Arc::new(MemoryProvider::new(10));
    let first = PlacementCoordinator::new(provider.clone(), config(10, 1)).unwrap();
    let ids = first.place(40).await.unwrap();
    assert_eq!(provider.unit_count(), 4);

    let second = PlacementCoordinator::new(provider.clone(), config(10, 1)).unwrap();

    for id in &ids {
        let before = first.locate(id).unwrap();
        let after = second.locate(id).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
    assert!(second.free_units().is_empty());
}

#[tokio::test]
async fn recovered_free_slots_are_reused() {
    let provider = Arc::new(MemoryProvider::new(5));
    let first = PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap();
    first.place(3).await.unwrap();
    drop(first);

    let second = PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap();
    second.place(2).await.unwrap();

    assert_eq!(provider.request_count(), 1);
    assert_consistent(&second, 1);
}

#[tokio::test]
async fn partial_provisioning_failure_keeps_placed_workloads() {
    let provider = Arc::new(MemoryProvider::new(2));
    let config = CoordinatorConfig::new(2, 1).with_provisioning(ProvisioningConfig {
        max_failed_requests: 0,
        retry_backoff_ms: 0,
    });
    let coordinator = PlacementCoordinator::new(provider.clone(), config).unwrap();
    provider.fail_next(1);

    let err = coordinator.place(4).await.unwrap_err();

    match err {
        PlacementError::Provisioning {
            placed, failures, ..
        } => {
            assert_eq!(failures, 1);
            assert_eq!(placed.len(), 2);
            for id in &placed {
                coordinator.locate(id).unwrap();
            }
        }
        other => panic!("expected provisioning error, got {other}"),
    }
    assert_eq!(provider.request_count(), 2);
}

#[tokio::test]
async fn transient_failures_do_not_undershoot() {
    let (provider, coordinator) = setup(3, 1);
    provider.fail_next(2);

    let ids = coordinator.place(7).await.unwrap();

    assert_eq!(ids.len(), 7);
    assert_distinct(&ids);
    assert_eq!(provider.unit_count(), 3);
    assert_consistent(&coordinator, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_placement_still_pools_its_units() {
    let provider = Arc::new(MemoryProvider::new(5).with_latency(Duration::from_millis(200)));
    let coordinator = PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap();

    let result = tokio::time::timeout(Duration::from_millis(50), coordinator.place(2)).await;
    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(400)).await;

    let issued = provider.all_units();
    assert_eq!(issued.len(), 1);
    assert_eq!(coordinator.free_units(), vec![issued[0].unit_id()]);

    coordinator.place(1).await.unwrap();

    assert_eq!(provider.request_count(), 1);
    assert_consistent(&coordinator, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_is_served_after_round_owner_is_dropped() {
    let provider = Arc::new(MemoryProvider::new(5).with_latency(Duration::from_millis(300)));
    let coordinator =
        Arc::new(PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap());

    let owner = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            tokio::time::timeout(Duration::from_millis(100), coordinator.place(2))
                .await
                .is_err()
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let waiter = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.place(2).await }
    });

    assert!(owner.await.unwrap(), "owner should have timed out");
    let ids = waiter.await.unwrap().unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(provider.request_count(), 1);
    assert_consistent(&coordinator, 1);
}

/// Reports room but refuses every placement.
#[derive(Debug)]
struct RefusingUnit;

impl ComputeUnit for RefusingUnit {
    fn unit_id(&self) -> UnitId {
        UnitId::new(0)
    }

    fn total_capacity(&self) -> u64 {
        5
    }

    fn remaining_capacity(&self) -> u64 {
        5
    }

    fn placed_workloads(&self) -> Vec<WorkloadId> {
        Vec::new()
    }

    fn place(&self, size: u64) -> UnitResult<WorkloadId> {
        Err(UnitError::Capacity {
            requested: size,
            remaining: 0,
        })
    }

    fn unplace(&self, workload: &WorkloadId) -> UnitResult<()> {
        Err(UnitError::UnknownWorkload(workload.clone()))
    }
}

/// A memory provider that also lists one pre-existing refusing unit.
struct RefusingUnitProvider {
    inner: MemoryProvider,
    refusing: SharedUnit,
}

impl CapacityProvider for RefusingUnitProvider {
    fn request_unit(&self) -> anyhow::Result<SharedUnit> {
        self.inner.request_unit()
    }

    fn all_units(&self) -> Vec<SharedUnit> {
        let mut units = vec![Arc::clone(&self.refusing)];
        units.extend(self.inner.all_units());
        units
    }
}

#[tokio::test]
async fn refusing_free_unit_leaves_the_pool() {
    let provider = Arc::new(RefusingUnitProvider {
        inner: MemoryProvider::new(5),
        refusing: Arc::new(RefusingUnit),
    });
    let coordinator = PlacementCoordinator::new(provider.clone(), config(5, 1)).unwrap();
    assert_eq!(coordinator.free_units(), vec![UnitId::new(0)]);

    let ids = coordinator.place(2).await.unwrap();

    assert_eq!(ids.len(), 2);
    assert_distinct(&ids);
    assert!(!coordinator.free_units().contains(&UnitId::new(0)));
    for id in &ids {
        assert_ne!(coordinator.locate(id).unwrap().unit_id(), UnitId::new(0));
    }
    assert_eq!(provider.inner.request_count(), 1);
    assert_eq!(coordinator.snapshot().total_remaining(), 3);
    assert_consistent(&coordinator, 1);
}
