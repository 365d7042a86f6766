//! Node call errors.

use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

/// Why a call to a worker node did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Connection refused, reset, or otherwise failed on the network.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The call did not finish within its deadline.
    #[error("node call timed out: {0}")]
    Timeout(String),

    /// The node answered but refused the request.
    #[error("node rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// The node answered with something that is not the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl NodeError {
    /// Network failure or timeout: the node may still be doing the work.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, NodeError::Unreachable(_) | NodeError::Timeout(_))
    }
}
