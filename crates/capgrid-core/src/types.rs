//! Identifiers shared across CapGrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a compute unit handed out by a capacity provider.
///
/// Providers must never reuse an id, even after a unit goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u64);

impl UnitId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Opaque, globally unique identifier of a placed workload (container).
///
/// Equality is by the underlying string. Ids are minted by the unit that
/// hosts the workload and stay unique across every unit ever created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for the `seq`-th workload ever placed on `unit`.
    pub fn for_unit(unit: UnitId, seq: u64) -> Self {
        Self(format!("{unit}/{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkloadId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
