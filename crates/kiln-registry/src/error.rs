//! Registry error types.

use thiserror::Error;

use kiln_core::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("node already registered: {0}")]
    AlreadyRegistered(NodeId),

    #[error("node {node_id} at capacity ({current_load}/{max_concurrent})")]
    CapacityExceeded {
        node_id: NodeId,
        current_load: u32,
        max_concurrent: u32,
    },

    #[error("node {node_id} load {current_load} cannot drop by {delta}")]
    LoadUnderflow {
        node_id: NodeId,
        current_load: u32,
        delta: i32,
    },

    #[error("slot lease on node {node_id} predates its re-registration")]
    StaleLease { node_id: NodeId },

    #[error("invalid node: {0}")]
    Invalid(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
