//! kiln-health — node heartbeat monitoring.
//!
//! Each registered node gets its own probe task with its own
//! cancellation token. Probe start times are staggered across the
//! interval. A probe only changes the node's status and heartbeat
//! metadata in the registry; it never touches tasks running there.

pub mod checker;
pub mod monitor;

pub use checker::{HealthTracker, ProbeOutcome, Verdict, probe};
pub use monitor::HealthMonitor;
