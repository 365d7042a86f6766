//! Probe execution and heartbeat bookkeeping.
//!
//! `HealthTracker` is pure: it is fed probe outcomes with the instant they
//! were observed and answers what the registry should record.

use std::time::{Duration, Instant};

use tracing::debug;

use kiln_core::{NodeStatus, epoch_millis};
use kiln_node::{HealthReport, NodeClient, NodeError, ReportedHealth, with_timeout};

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The node answered within the timeout.
    Reported(ReportedHealth),
    /// Connection error, timeout, or an unusable answer.
    Failed(NodeError),
}

/// What the registry should record for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Successful heartbeat; the node takes this status unless it is in
    /// maintenance.
    Heartbeat(NodeStatus),
    /// Failed probe. `mark_offline` once the heartbeat timeout has elapsed
    /// since the last success.
    Missed { mark_offline: bool },
}

/// Tracks the heartbeat stream of a single node.
#[derive(Debug)]
pub struct HealthTracker {
    heartbeat_timeout: Duration,
    /// Last success, or tracker creation before the first one.
    last_success: Instant,
}

impl HealthTracker {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self::starting_at(heartbeat_timeout, Instant::now())
    }

    pub fn starting_at(heartbeat_timeout: Duration, now: Instant) -> Self {
        Self {
            heartbeat_timeout,
            last_success: now,
        }
    }

    /// Continue from the heartbeat the registry last recorded (epoch ms),
    /// so a restarted probe loop does not grant the node a fresh timeout.
    pub fn resuming(heartbeat_timeout: Duration, last_heartbeat: Option<u64>) -> Self {
        Self::resuming_at(heartbeat_timeout, last_heartbeat, epoch_millis(), Instant::now())
    }

    /// As [`HealthTracker::resuming`], with the wall clock reading `now_ms`
    /// taken at `now`.
    pub fn resuming_at(
        heartbeat_timeout: Duration,
        last_heartbeat: Option<u64>,
        now_ms: u64,
        now: Instant,
    ) -> Self {
        let last_success = last_heartbeat
            .map(|at| Duration::from_millis(now_ms.saturating_sub(at)).min(heartbeat_timeout))
            .and_then(|ago| now.checked_sub(ago))
            .unwrap_or(now);
        Self::starting_at(heartbeat_timeout, last_success)
    }

    /// Record a probe observed now.
    pub fn record(&mut self, outcome: &ProbeOutcome) -> Verdict {
        self.record_at(outcome, Instant::now())
    }

    /// Record a probe observed at `now`.
    pub fn record_at(&mut self, outcome: &ProbeOutcome, now: Instant) -> Verdict {
        match outcome {
            ProbeOutcome::Reported(health) => {
                self.last_success = now;
                Verdict::Heartbeat(status_for(*health))
            }
            ProbeOutcome::Failed(_) => {
                let silent_for = now.saturating_duration_since(self.last_success);
                Verdict::Missed {
                    mark_offline: silent_for >= self.heartbeat_timeout,
                }
            }
        }
    }
}

/// Registry status for a self-reported health value.
pub fn status_for(health: ReportedHealth) -> NodeStatus {
    match health {
        ReportedHealth::Ok => NodeStatus::Online,
        ReportedHealth::Busy => NodeStatus::Busy,
        ReportedHealth::Degraded => NodeStatus::Error,
    }
}

/// Call the node's health operation with a deadline.
pub async fn probe(client: &dyn NodeClient, timeout: Duration) -> ProbeOutcome {
    match with_timeout("health", timeout, client.health()).await {
        Ok(HealthReport { status, load }) => {
            if let Some(load) = load {
                debug!(running = load.running, queued = load.queued, ?status, "health reported");
            }
            ProbeOutcome::Reported(status)
        }
        Err(e) => ProbeOutcome::Failed(e),
    }
}
