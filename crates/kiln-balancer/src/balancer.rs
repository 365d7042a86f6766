//! The load balancer.

use std::collections::HashSet;

use tracing::debug;

use kiln_core::{NodeId, NodeSnapshot, StrategyKind};

use crate::error::{BalancerError, BalancerResult};
use crate::strategy::Strategy;

/// Selects nodes for jobs under one configured strategy.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub fn from_kind(kind: StrategyKind) -> Self {
        Self::new(Strategy::from_kind(kind))
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Select a node for `job_kind` from a registry snapshot.
    ///
    /// Nodes in `avoid` are skipped when any other eligible node exists;
    /// if avoiding them would leave nothing, they are considered again.
    /// The returned node is always online, capable, and below capacity.
    pub fn select(
        &self,
        job_kind: &str,
        nodes: &[NodeSnapshot],
        avoid: &HashSet<NodeId>,
    ) -> BalancerResult<NodeSnapshot> {
        let eligible: Vec<&NodeSnapshot> =
            nodes.iter().filter(|n| n.is_eligible(job_kind)).collect();
        if eligible.is_empty() {
            return Err(BalancerError::NoEligibleNode {
                job_kind: job_kind.to_string(),
            });
        }

        let preferred: Vec<&NodeSnapshot> = eligible
            .iter()
            .copied()
            .filter(|n| !avoid.contains(&n.id))
            .collect();
        let candidates = if preferred.is_empty() {
            &eligible
        } else {
            &preferred
        };

        let picked = self
            .strategy
            .pick(job_kind, candidates, nodes)
            .ok_or_else(|| BalancerError::NoEligibleNode {
                job_kind: job_kind.to_string(),
            })?;
        debug!(
            %job_kind,
            node_id = %picked.id,
            strategy = %self.strategy.kind(),
            candidates = candidates.len(),
            "node selected"
        );
        Ok(picked.clone())
    }
}
