//! Selection strategies.
//!
//! Every strategy receives the already-filtered eligible set in registry
//! order and returns one of its members. Stateful strategies own their
//! state: the round-robin cursors and the weighted random source live in
//! the variant.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use kiln_core::{JobKind, NodeId, NodeSnapshot, StrategyKind};

/// A configured selection strategy.
pub enum Strategy {
    /// Lowest load ratio, then lowest absolute load, then node id.
    LeastLoaded,
    /// Rotates through the eligible set, one cursor per job kind.
    RoundRobin {
        /// Last node picked for each job kind.
        cursors: Mutex<HashMap<JobKind, NodeId>>,
    },
    /// Random pick proportional to `metadata.weight`.
    Weighted {
        rng: Mutex<Box<dyn RngCore + Send>>,
    },
    /// Highest `metadata.priority`; ties go to the least-loaded node.
    PriorityBased,
}

impl Strategy {
    pub fn from_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::LeastLoaded => Strategy::LeastLoaded,
            StrategyKind::RoundRobin => Strategy::round_robin(),
            StrategyKind::Weighted => Strategy::weighted(Box::new(StdRng::from_os_rng())),
            StrategyKind::PriorityBased => Strategy::PriorityBased,
        }
    }

    pub fn round_robin() -> Self {
        Strategy::RoundRobin {
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Weighted strategy drawing from `rng`; tests pass a seeded one.
    pub fn weighted(rng: Box<dyn RngCore + Send>) -> Self {
        Strategy::Weighted {
            rng: Mutex::new(rng),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::LeastLoaded => StrategyKind::LeastLoaded,
            Strategy::RoundRobin { .. } => StrategyKind::RoundRobin,
            Strategy::Weighted { .. } => StrategyKind::Weighted,
            Strategy::PriorityBased => StrategyKind::PriorityBased,
        }
    }

    /// Pick from `eligible` (non-empty, registry order). `order` is the
    /// full registry order, used by round-robin to place its cursor.
    pub(crate) fn pick<'a>(
        &self,
        job_kind: &str,
        eligible: &[&'a NodeSnapshot],
        order: &[NodeSnapshot],
    ) -> Option<&'a NodeSnapshot> {
        match self {
            Strategy::LeastLoaded => least_loaded(eligible),
            Strategy::RoundRobin { cursors } => {
                let mut cursors = cursors.lock().unwrap_or_else(|e| e.into_inner());
                let picked = next_after(cursors.get(job_kind), eligible, order)?;
                cursors.insert(job_kind.to_string(), picked.id.clone());
                Some(picked)
            }
            Strategy::Weighted { rng } => {
                let mut rng = rng.lock().unwrap_or_else(|e| e.into_inner());
                weighted(eligible, rng.as_mut())
            }
            Strategy::PriorityBased => {
                let top = eligible.iter().map(|n| n.metadata.priority).max()?;
                let tied: Vec<&NodeSnapshot> = eligible
                    .iter()
                    .copied()
                    .filter(|n| n.metadata.priority == top)
                    .collect();
                least_loaded(&tied)
            }
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Strategy({})", self.kind())
    }
}

/// Total order used by `LeastLoaded`.
fn compare_load(a: &NodeSnapshot, b: &NodeSnapshot) -> Ordering {
    a.load_ratio()
        .partial_cmp(&b.load_ratio())
        .unwrap_or(Ordering::Equal)
        .then(a.current_load.cmp(&b.current_load))
        .then_with(|| a.id.cmp(&b.id))
}

fn least_loaded<'a>(eligible: &[&'a NodeSnapshot]) -> Option<&'a NodeSnapshot> {
    eligible.iter().copied().min_by(|a, b| compare_load(a, b))
}

/// First eligible node positioned after `last` in registry order,
/// wrapping to the front.
fn next_after<'a>(
    last: Option<&NodeId>,
    eligible: &[&'a NodeSnapshot],
    order: &[NodeSnapshot],
) -> Option<&'a NodeSnapshot> {
    let position = |id: &str| order.iter().position(|n| n.id == id);
    let after = last.and_then(|id| position(id));
    match after {
        Some(cursor) => eligible
            .iter()
            .copied()
            .find(|n| position(&n.id).is_some_and(|p| p > cursor))
            .or_else(|| eligible.first().copied()),
        None => eligible.first().copied(),
    }
}

fn weighted<'a>(eligible: &[&'a NodeSnapshot], rng: &mut dyn RngCore) -> Option<&'a NodeSnapshot> {
    let total: u64 = eligible.iter().map(|n| u64::from(n.metadata.weight)).sum();
    if total == 0 {
        return least_loaded(eligible);
    }
    let mut roll = rng.random_range(0..total);
    for node in eligible {
        let weight = u64::from(node.metadata.weight);
        if roll < weight {
            return Some(*node);
        }
        roll -= weight;
    }
    eligible.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{NodeMetadata, NodeStatus};

    fn node(id: &str, load: u32, max: u32) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            address: format!("{id}:8188"),
            max_concurrent: max,
            current_load: load,
            capabilities: ["image".to_string()].into(),
            status: NodeStatus::Online,
            metadata: NodeMetadata::default(),
            last_heartbeat: None,
            consecutive_failures: 0,
        }
    }

    #[test]
    fn least_loaded_orders_by_ratio_then_load_then_id() {
        let a = node("a", 2, 4);
        let b = node("b", 1, 2);
        let c = node("c", 2, 8);
        assert_eq!(least_loaded(&[&a, &b, &c]).unwrap().id, "c");

        // Equal ratio: lower absolute load wins.
        let d = node("d", 2, 4);
        let e = node("e", 1, 2);
        assert_eq!(least_loaded(&[&d, &e]).unwrap().id, "e");

        // Full tie: lowest id.
        let f = node("f", 1, 2);
        let g = node("g", 1, 2);
        assert_eq!(least_loaded(&[&g, &f]).unwrap().id, "f");
    }

    #[test]
    fn next_after_wraps_in_registry_order() {
        let order = vec![node("a", 0, 1), node("b", 0, 1), node("c", 0, 1)];
        let eligible: Vec<&NodeSnapshot> = order.iter().collect();

        assert_eq!(next_after(None, &eligible, &order).unwrap().id, "a");
        assert_eq!(next_after(Some(&"a".to_string()), &eligible, &order).unwrap().id, "b");
        assert_eq!(next_after(Some(&"c".to_string()), &eligible, &order).unwrap().id, "a");

        // Cursor node no longer eligible: continue after its position.
        let without_b: Vec<&NodeSnapshot> = vec![&order[0], &order[2]];
        assert_eq!(next_after(Some(&"b".to_string()), &without_b, &order).unwrap().id, "c");

        // Cursor node gone from the registry: restart at the front.
        assert_eq!(next_after(Some(&"zz".to_string()), &eligible, &order).unwrap().id, "a");
    }

    #[test]
    fn weighted_zero_total_falls_back_to_least_loaded() {
        let mut a = node("a", 1, 2);
        let mut b = node("b", 0, 2);
        a.metadata.weight = 0;
        b.metadata.weight = 0;
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(weighted(&[&a, &b], &mut rng).unwrap().id, "b");
    }

    #[test]
    fn weighted_never_picks_zero_weight() {
        let mut a = node("a", 0, 2);
        let b = node("b", 0, 2);
        a.metadata.weight = 0;
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            assert_eq!(weighted(&[&a, &b], &mut rng).unwrap().id, "b");
        }
    }

    #[test]
    fn strategy_kind_round_trips() {
        for kind in [
            StrategyKind::LeastLoaded,
            StrategyKind::RoundRobin,
            StrategyKind::Weighted,
            StrategyKind::PriorityBased,
        ] {
            assert_eq!(Strategy::from_kind(kind).kind(), kind);
        }
    }
}
