//! CapGrid placement coordinator — bin-packing onto elastic capacity.
//!
//! Places fixed-size containers onto fixed-size compute units. Units with
//! spare room are filled first; when they run out, the coordinator asks
//! the capacity provider for the minimum number of fresh units, in
//! parallel, and fills each one as it arrives.
//!
//! # Components
//!
//! - **`coordinator`** — `PlacementCoordinator` (place, locate, unplace)
//! - **`packer`** — Slot arithmetic and unit filling
//! - **`fanout`** — Concurrent provider requests, completion-ordered
//! - **`recovery`** — Rebuilds coordinator state from the provider's units
//! - **`snapshot`** — Serializable view of placements for inspection

pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod packer;
pub mod recovery;
pub mod snapshot;

pub use coordinator::PlacementCoordinator;
pub use error::{PlacementError, PlacementResult};
pub use fanout::{Allocation, FanOut, allocate_units_parallel};
pub use packer::{Fill, fill_unit, slots_available, units_needed};
pub use snapshot::{PlacementSnapshot, UnitSnapshot};
