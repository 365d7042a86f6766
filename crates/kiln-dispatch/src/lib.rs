//! kiln-dispatch — task-to-node assignment.
//!
//! The [`Dispatcher`] accepts tasks from the job queue, runs one owner
//! future per task, and keeps the assignment ledger. Each owner selects a
//! node through the load balancer, reserves a slot in the registry,
//! submits the job, and polls it to a terminal state, retrying failed
//! attempts within the task's budget.
//!
//! Execution is at-least-once: a job on a node that stops answering
//! status polls is presumed lost and reassigned, so it may in rare cases
//! run twice.

pub mod dispatcher;
pub mod error;
pub mod event;
mod intake;
mod owner;

pub use dispatcher::{Dispatcher, RetryPolicy};
pub use error::{DispatchError, DispatchResult};
pub use event::TaskEvent;
