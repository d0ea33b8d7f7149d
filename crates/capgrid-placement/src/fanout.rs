//! Parallel provider requests.
//!
//! Provider calls block, possibly for minutes, so each one runs on the
//! blocking thread pool. Results are handed back in completion order: a
//! fast request is never stuck behind a slow one submitted earlier.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use capgrid_core::{CapacityProvider, SharedUnit};

use crate::error::{PlacementError, PlacementResult};

/// An in-flight batch of provider requests.
pub struct FanOut {
    tasks: JoinSet<anyhow::Result<SharedUnit>>,
    requested: usize,
}

impl FanOut {
    /// Issue `count` concurrent `request_unit` calls.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(provider: &Arc<dyn CapacityProvider>, count: usize) -> Self {
        let mut tasks = JoinSet::new();
        for _ in 0..count {
            let provider = Arc::clone(provider);
            tasks.spawn_blocking(move || provider.request_unit());
        }
        debug!(requested = count, "provider fan-out started");
        Self {
            tasks,
            requested: count,
        }
    }

    /// A batch with nothing in flight.
    pub fn empty() -> Self {
        Self {
            tasks: JoinSet::new(),
            requested: 0,
        }
    }

    /// Number of requests issued by this batch.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Requests that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next request to complete, whichever it is.
    ///
    /// Returns `None` once every request has been consumed. A provider
    /// error or a panicked request both surface as
    /// [`PlacementError::ProviderRequest`].
    pub async fn next(&mut self) -> Option<PlacementResult<SharedUnit>> {
        let joined = self.tasks.join_next().await?;
        Some(match joined {
            Ok(Ok(unit)) => Ok(unit),
            Ok(Err(e)) => Err(PlacementError::ProviderRequest(format!("{e:#}"))),
            Err(e) => Err(PlacementError::ProviderRequest(format!(
                "provider request task failed: {e}"
            ))),
        })
    }
}

/// Result of [`allocate_units_parallel`].
#[derive(Debug, Default)]
pub struct Allocation {
    /// Units in the order their requests completed.
    pub units: Vec<SharedUnit>,
    /// One entry per failed request.
    pub failures: Vec<PlacementError>,
}

/// Request `count` units concurrently and collect them as they complete.
///
/// Failed requests are logged and reported in [`Allocation::failures`]; the
/// caller decides whether to re-request the shortfall.
pub async fn allocate_units_parallel(
    provider: &Arc<dyn CapacityProvider>,
    count: usize,
) -> Allocation {
    let mut fanout = FanOut::spawn(provider, count);
    let mut allocation = Allocation::default();

    while let Some(result) = fanout.next().await {
        match result {
            Ok(unit) => allocation.units.push(unit),
            Err(e) => {
                warn!(error = %e, "provider request failed");
                allocation.failures.push(e);
            }
        }
    }

    info!(
        requested = count,
        received = allocation.units.len(),
        failed = allocation.failures.len(),
        "parallel allocation finished"
    );
    allocation
}
