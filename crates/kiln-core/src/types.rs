//! Node domain types shared across Kiln crates.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Stable identifier of a worker node.
pub type NodeId = String;

/// Caller-supplied identifier of a task.
pub type TaskId = String;

/// A kind of job a node can execute (e.g. "image", "video").
pub type JobKind = String;

// ── Node status ────────────────────────────────────────────────────

/// Operational status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Busy,
    Offline,
    Error,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Busy => "busy",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
            NodeStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "busy" => Ok(NodeStatus::Busy),
            "offline" => Ok(NodeStatus::Offline),
            "error" => Ok(NodeStatus::Error),
            "maintenance" => Ok(NodeStatus::Maintenance),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

// ── Node descriptor (static config) ───────────────────────────────

/// Operator-assigned metadata. Only display and the weighted /
/// priority strategies read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMetadata {
    #[serde(default)]
    pub location: Option<String>,
    /// Relative selection weight for the weighted strategy.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Higher wins under the priority strategy.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            location: None,
            weight: default_weight(),
            priority: 0,
            tags: Vec::new(),
        }
    }
}

/// Static description of a node, as found in `kiln.toml` or a
/// dynamic registration request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub max_concurrent: u32,
    pub capabilities: BTreeSet<JobKind>,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

impl NodeDescriptor {
    /// `host:port` used to reach the node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Node snapshot ──────────────────────────────────────────────────

/// Point-in-time copy of a node's registry entry.
///
/// Snapshots are what the balancer and the API see; mutating one has
/// no effect on the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub address: String,
    pub max_concurrent: u32,
    pub current_load: u32,
    pub capabilities: BTreeSet<JobKind>,
    pub status: NodeStatus,
    pub metadata: NodeMetadata,
    /// Unix timestamp (ms) of the last successful health probe.
    pub last_heartbeat: Option<u64>,
    pub consecutive_failures: u32,
}

impl NodeSnapshot {
    /// `current_load / max_concurrent`; a zero-capacity node reads as full.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_concurrent)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    pub fn can_run(&self, job_kind: &str) -> bool {
        self.capabilities.contains(job_kind)
    }

    /// Strategy-independent eligibility: online, capable, not saturated.
    pub fn is_eligible(&self, job_kind: &str) -> bool {
        self.status == NodeStatus::Online && self.can_run(job_kind) && self.has_capacity()
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
