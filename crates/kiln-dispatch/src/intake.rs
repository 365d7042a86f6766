//! Intake ordering: waiting tasks start highest priority first, then in
//! submission order.

use std::cmp::Ordering;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use kiln_core::Task;

/// A submitted task waiting for the intake loop to start its owner.
pub(crate) struct Pending {
    pub priority: i32,
    pub seq: u64,
    pub task: Task,
    pub tx: watch::Sender<Task>,
    pub token: CancellationToken,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    /// Max-heap order: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
