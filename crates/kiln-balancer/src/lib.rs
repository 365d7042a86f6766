//! kiln-balancer — picks a node for a job.
//!
//! Selection always starts from the same eligibility filter (online,
//! capable, below capacity); the configured [`Strategy`] only chooses
//! among the survivors. An empty survivor set is a normal outcome,
//! reported as [`BalancerError::NoEligibleNode`].

pub mod balancer;
pub mod error;
pub mod strategy;

pub use balancer::LoadBalancer;
pub use error::{BalancerError, BalancerResult};
pub use strategy::Strategy;
