//! kiln-core — shared types for the Kiln dispatch engine.
//!
//! Holds the node and task domain model used by every other crate,
//! the task state machine, and `kiln.toml` configuration parsing.

pub mod config;
pub mod duration;
pub mod task;
pub mod types;

pub use config::{
    BalancerSettings, ConfigError, DispatchSettings, HealthSettings, KilnConfig, StrategyKind,
    validate_node,
};
pub use duration::parse_duration;
pub use task::{Assignment, Resolution, Task, TaskError, TaskRequest, TaskState};
pub use types::*;
