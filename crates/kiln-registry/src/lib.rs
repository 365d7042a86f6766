//! kiln-registry — the authoritative in-memory view of the node pool.
//!
//! Every node lives in its own locked slot; `adjust_load` and the status
//! setters lock only the node they touch, so dispatch decisions on
//! different nodes never contend. Mutations are written through to the
//! audit store when one is attached.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{NodeRegistry, ReloadSummary, SlotLease, StatusChange};
