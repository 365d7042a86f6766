//! Dispatcher error types.

use thiserror::Error;

use kiln_core::{NodeId, TaskError, TaskId, TaskState};
use kiln_node::NodeError;
use kiln_state::StateError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already submitted: {0}")]
    DuplicateTask(TaskId),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task {task_id} is already {state}")]
    AlreadyTerminal { task_id: TaskId, state: TaskState },

    #[error("task {task_id} is still {state}")]
    NotTerminal { task_id: TaskId, state: TaskState },

    /// Network failure or timeout talking to a node.
    #[error("node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: NodeId, reason: String },

    /// The node refused the request.
    #[error("node {node_id} rejected the job: {reason}")]
    NodeRejected { node_id: NodeId, reason: String },

    /// The node ran the job and reported it failed.
    #[error("job failed on node {node_id}: {reason}")]
    JobFailed { node_id: NodeId, reason: String },

    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("task lifecycle error: {0}")]
    Lifecycle(#[from] TaskError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl DispatchError {
    /// Classify a failed node call made on behalf of an attempt.
    pub fn from_node(node_id: &str, err: NodeError) -> Self {
        let node_id = node_id.to_string();
        match err {
            NodeError::Unreachable(reason) => DispatchError::NodeUnreachable { node_id, reason },
            NodeError::Timeout(what) => DispatchError::NodeUnreachable {
                node_id,
                reason: format!("timed out: {what}"),
            },
            NodeError::Rejected { status, reason } => DispatchError::NodeRejected {
                node_id,
                reason: format!("{status}: {reason}"),
            },
            NodeError::Protocol(reason) => DispatchError::NodeRejected {
                node_id,
                reason: format!("protocol error: {reason}"),
            },
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_errors_are_classified() {
        let timeout = DispatchError::from_node("n1", NodeError::Timeout("submit".to_string()));
        assert!(matches!(timeout, DispatchError::NodeUnreachable { .. }));

        let refused = DispatchError::from_node(
            "n1",
            NodeError::Rejected {
                status: 503,
                reason: "queue full".to_string(),
            },
        );
        assert!(matches!(refused, DispatchError::NodeRejected { .. }));
        assert!(refused.to_string().contains("queue full"));
    }

    #[test]
    fn exhausted_budget_carries_last_error() {
        let err = DispatchError::RetryBudgetExhausted {
            attempts: 4,
            last_error: "node n2 unreachable: connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "retry budget exhausted after 4 attempts: node n2 unreachable: connection refused"
        );
    }
}
