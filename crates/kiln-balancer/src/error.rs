//! Balancer error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    /// Every capable node is offline, saturated, or otherwise unselectable.
    #[error("no eligible node for job kind {job_kind}")]
    NoEligibleNode { job_kind: String },
}

pub type BalancerResult<T> = Result<T, BalancerError>;
