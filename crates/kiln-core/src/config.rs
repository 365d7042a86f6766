//! kiln.toml configuration parser.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;
use crate::types::NodeDescriptor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration: balancing policy plus the static node list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub balancer: BalancerSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
}

/// Load-balancing strategy names accepted in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    LeastLoaded,
    RoundRobin,
    Weighted,
    PriorityBased,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::LeastLoaded => "least_loaded",
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::Weighted => "weighted",
            StrategyKind::PriorityBased => "priority_based",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_loaded" => Ok(StrategyKind::LeastLoaded),
            "round_robin" => Ok(StrategyKind::RoundRobin),
            "weighted" => Ok(StrategyKind::Weighted),
            "priority_based" => Ok(StrategyKind::PriorityBased),
            other => Err(ConfigError::Invalid(format!("unknown strategy: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Retries prefer nodes that have not already failed the task.
    #[serde(default = "default_true")]
    pub failover: bool,
    /// A task gets `max_retries + 1` attempts in total.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            failover: true,
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(with = "serde_str", default = "default_health_interval")]
    pub interval: Duration,
    #[serde(with = "serde_str", default = "default_health_timeout")]
    pub timeout: Duration,
    /// Time since the last good probe after which a node goes offline.
    #[serde(with = "serde_str", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            heartbeat_timeout: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(with = "serde_str", default = "default_submit_timeout")]
    pub submit_timeout: Duration,
    #[serde(with = "serde_str", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "serde_str", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    #[serde(with = "serde_str", default = "default_cancel_timeout")]
    pub cancel_timeout: Duration,
    /// Consecutive failed status polls before the job is presumed lost.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    /// Wait before re-running selection when no node is eligible.
    #[serde(with = "serde_str", default = "default_requeue_backoff")]
    pub requeue_backoff: Duration,
    /// Ask the original node once more before reassigning a lost job.
    #[serde(default)]
    pub late_result_check: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            submit_timeout: default_submit_timeout(),
            poll_interval: default_poll_interval(),
            poll_timeout: default_poll_timeout(),
            cancel_timeout: default_cancel_timeout(),
            max_poll_failures: default_max_poll_failures(),
            requeue_backoff: default_requeue_backoff(),
            late_result_check: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(45)
}
fn default_submit_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_poll_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_cancel_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_poll_failures() -> u32 {
    3
}
fn default_requeue_backoff() -> Duration {
    Duration::from_secs(2)
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: KilnConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            validate_node(node)?;
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id: {}", node.id)));
            }
        }

        let durations = [
            ("health.interval", self.health.interval),
            ("health.timeout", self.health.timeout),
            ("health.heartbeat_timeout", self.health.heartbeat_timeout),
            ("dispatch.submit_timeout", self.dispatch.submit_timeout),
            ("dispatch.poll_interval", self.dispatch.poll_interval),
            ("dispatch.poll_timeout", self.dispatch.poll_timeout),
            ("dispatch.cancel_timeout", self.dispatch.cancel_timeout),
            ("dispatch.requeue_backoff", self.dispatch.requeue_backoff),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        if self.health.heartbeat_timeout < self.health.interval {
            return Err(ConfigError::Invalid(
                "health.heartbeat_timeout must be at least health.interval".to_string(),
            ));
        }
        if self.dispatch.max_poll_failures == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_poll_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checks that apply to a single node, whether configured or registered.
pub fn validate_node(node: &NodeDescriptor) -> Result<(), ConfigError> {
    if node.id.trim().is_empty() {
        return Err(ConfigError::Invalid("node id must not be empty".to_string()));
    }
    if node.host.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("node {}: host must not be empty", node.id)));
    }
    if node.max_concurrent == 0 {
        return Err(ConfigError::Invalid(format!(
            "node {}: max_concurrent must be at least 1",
            node.id
        )));
    }
    Ok(())
}
