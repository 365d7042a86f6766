//! Task lifecycle: the canonical state machine and the per-task
//! assignment history.
//!
//! ```text
//! queued ──▶ assigned ──▶ running ──▶ completed
//!   │  ▲         │           │
//!   │  └─────────┴───────────┤  (retry: attempt failed, budget left)
//!   │                        ▼
//!   ├──────────────────▶  failed      (budget exhausted)
//!   └──▶ cancelled ◀── assigned | running
//! ```
//!
//! A failed attempt with retry budget left goes back to `queued`; the
//! task only reaches `failed` once the budget is gone.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{JobKind, NodeId, TaskId, epoch_millis};

/// Errors raised by illegal lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("task {task_id} already has an active assignment (attempt {attempt})")]
    ActiveAssignment { task_id: TaskId, attempt: u32 },

    #[error("task {0} has no active assignment")]
    NoActiveAssignment(TaskId),
}

// ── State machine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// `assigned` or `running`: a node currently owns the work.
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Queued)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Assignment ─────────────────────────────────────────────────────

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Completed,
    Failed,
    /// The node was presumed lost mid-job and the task moved on.
    Reassigned,
    Cancelled,
}

/// One attempt of one task on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub node_id: NodeId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Identifier the node gave the job, once submission succeeded.
    pub node_job_id: Option<String>,
    pub assigned_at: u64,
    pub resolved_at: Option<u64>,
    pub resolution: Option<Resolution>,
    pub error: Option<String>,
}

impl Assignment {
    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// A validated job request handed over by the job queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub id: TaskId,
    pub job_kind: JobKind,
    #[serde(default)]
    pub priority: i32,
    /// Opaque job parameters, forwarded to the node untouched.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A task and its full attempt history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub job_kind: JobKind,
    pub priority: i32,
    pub parameters: serde_json::Value,
    pub submitted_at: u64,
    state: TaskState,
    /// Failed attempts so far.
    pub retries: u32,
    assignments: Vec<Assignment>,
    pub progress: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub updated_at: u64,
}

impl Task {
    pub fn new(request: TaskRequest) -> Self {
        let now = epoch_millis();
        Self {
            id: request.id,
            job_kind: request.job_kind,
            priority: request.priority,
            parameters: request.parameters,
            submitted_at: now,
            state: TaskState::Queued,
            retries: 0,
            assignments: Vec::new(),
            progress: None,
            result: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Number of attempts started, including an open one.
    pub fn attempts(&self) -> u32 {
        self.assignments.len() as u32
    }

    pub fn active_assignment(&self) -> Option<&Assignment> {
        self.assignments.last().filter(|a| a.is_open())
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: TaskState) -> Result<(), TaskError> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = epoch_millis();
        Ok(())
    }

    /// Start a new attempt on `node_id`.
    pub fn open_assignment(&mut self, node_id: &str) -> Result<&Assignment, TaskError> {
        if let Some(active) = self.active_assignment() {
            return Err(TaskError::ActiveAssignment {
                task_id: self.id.clone(),
                attempt: active.attempt,
            });
        }
        let assignment = Assignment {
            task_id: self.id.clone(),
            node_id: node_id.to_string(),
            attempt: self.attempts() + 1,
            node_job_id: None,
            assigned_at: epoch_millis(),
            resolved_at: None,
            resolution: None,
            error: None,
        };
        self.assignments.push(assignment);
        self.updated_at = epoch_millis();
        Ok(&self.assignments[self.assignments.len() - 1])
    }

    /// Record the node-side job id of the open attempt.
    pub fn set_node_job_id(&mut self, node_job_id: &str) -> Result<(), TaskError> {
        let id = self.id.clone();
        let active = self
            .assignments
            .last_mut()
            .filter(|a| a.is_open())
            .ok_or(TaskError::NoActiveAssignment(id))?;
        active.node_job_id = Some(node_job_id.to_string());
        Ok(())
    }

    /// Close the open attempt. Past attempts are never touched.
    pub fn resolve_assignment(
        &mut self,
        resolution: Resolution,
        error: Option<String>,
    ) -> Result<&Assignment, TaskError> {
        let id = self.id.clone();
        let active = self
            .assignments
            .last_mut()
            .filter(|a| a.is_open())
            .ok_or(TaskError::NoActiveAssignment(id))?;
        active.resolution = Some(resolution);
        active.resolved_at = Some(epoch_millis());
        active.error = error;
        self.updated_at = epoch_millis();
        Ok(&self.assignments[self.assignments.len() - 1])
    }
}
