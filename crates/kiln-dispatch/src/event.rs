//! Task lifecycle events.

use serde::{Deserialize, Serialize};

use kiln_core::{NodeId, Task, TaskId, TaskState};

/// Emitted on every task state change. Terminal events are the job
/// queue's completion or failure signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Attempts started so far.
    pub attempt: u32,
    /// Node of the latest attempt, if any.
    pub node_id: Option<NodeId>,
    pub detail: Option<String>,
}

impl TaskEvent {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            state: task.state(),
            attempt: task.attempts(),
            node_id: task.assignments().last().map(|a| a.node_id.clone()),
            detail: task.last_error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
