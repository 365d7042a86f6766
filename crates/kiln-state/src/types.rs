//! Persisted record types.

use serde::{Deserialize, Serialize};

use kiln_core::{Assignment, NodeSnapshot, Task, TaskState, epoch_millis};

/// Node snapshot as written through by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    #[serde(flatten)]
    pub node: NodeSnapshot,
    /// Unix timestamp (ms) of the write.
    pub recorded_at: u64,
}

impl NodeRecord {
    pub fn from_snapshot(node: NodeSnapshot) -> Self {
        Self {
            node,
            recorded_at: epoch_millis(),
        }
    }
}

/// Summary of a task's lifecycle; the attempts live in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub job_kind: String,
    pub priority: i32,
    pub state: TaskState,
    pub retries: u32,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub submitted_at: u64,
    pub updated_at: u64,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            job_kind: task.job_kind.clone(),
            priority: task.priority,
            state: task.state(),
            retries: task.retries,
            attempts: task.attempts(),
            last_error: task.last_error.clone(),
            submitted_at: task.submitted_at,
            updated_at: task.updated_at,
        }
    }
}

/// Ledger rows are the core `Assignment` type verbatim.
pub type AssignmentRecord = Assignment;

/// Build the composite key for the assignments table.
pub fn assignment_key(task_id: &str, attempt: u32) -> String {
    format!("{task_id}:{attempt:06}")
}
