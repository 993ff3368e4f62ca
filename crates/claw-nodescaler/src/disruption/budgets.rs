//! Per-NodePool disruption budget accounting for one pass.

use std::collections::BTreeMap;

use claw_provisioning::{BudgetRounding, DisruptionMethod, NodePool};
use tracing::warn;

use crate::context::ReconcileContext;
use crate::lifecycle::ClaimPhase;

/// Tracks how many more nodes each pool may lose during the current pass.
///
/// Nodes already `Disrupting` or `Terminating` count against the budget, as
/// does everything taken earlier in the same pass.
#[derive(Debug, Clone, Default)]
pub struct BudgetTracker {
    totals: BTreeMap<String, usize>,
    disrupting: BTreeMap<String, usize>,
    rounding: BudgetRounding,
}

impl BudgetTracker {
    /// Counts pool sizes and in-progress disruptions from `ctx`.
    #[must_use]
    pub fn new(ctx: &ReconcileContext, rounding: BudgetRounding) -> Self {
        let totals = ctx
            .nodepools
            .iter()
            .map(|p| (p.name.clone(), ctx.state.nodepool_size(&p.name)))
            .collect();
        let mut disrupting: BTreeMap<String, usize> = BTreeMap::new();
        for claim in ctx
            .claims
            .iter()
            .filter(|c| matches!(c.phase, ClaimPhase::Disrupting | ClaimPhase::Terminating))
        {
            *disrupting.entry(claim.nodepool.clone()).or_default() += 1;
        }
        Self {
            totals,
            disrupting,
            rounding,
        }
    }

    /// Nodes `pool` may still lose to `method`. A malformed budget allows none.
    #[must_use]
    pub fn remaining(&self, pool: &NodePool, method: DisruptionMethod) -> usize {
        let total = self.totals.get(&pool.name).copied().unwrap_or_default();
        let disrupting = self.disrupting.get(&pool.name).copied().unwrap_or_default();
        match pool.allowed_disruptions(method, total, disrupting, self.rounding) {
            Ok(n) => n,
            Err(e) => {
                warn!(nodepool = %pool.name, error = %e, "malformed disruption budget");
                0
            }
        }
    }

    /// Charges `n` disruptions to `pool` if the budget allows all of them.
    pub fn try_take(&mut self, pool: &NodePool, method: DisruptionMethod, n: usize) -> bool {
        if self.remaining(pool, method) < n {
            return false;
        }
        *self.disrupting.entry(pool.name.clone()).or_default() += n;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::claim;
    use claw_provisioning::requirements::LABEL_NODEPOOL;
    use claw_provisioning::{Budget, ClusterState, DisruptionPolicy, Node, OfferingCatalog};
    use test_case::test_case;

    fn ctx(nodes: usize, pool: NodePool, disrupting: usize) -> ReconcileContext {
        let nodes = (0..nodes)
            .map(|i| Node::new(format!("n{i}")).with_label(LABEL_NODEPOOL, pool.name.clone()))
            .collect();
        let claims = (0..disrupting)
            .map(|i| claim(&format!("c{i}"), &pool.name, ClaimPhase::Disrupting))
            .collect();
        ReconcileContext::new(
            ClusterState::snapshot(nodes, Vec::new(), Vec::new()),
            OfferingCatalog::new(),
            vec![pool],
        )
        .with_claims(claims)
    }

    fn pool_with_budget(raw: &str) -> NodePool {
        NodePool::new("default").with_disruption(DisruptionPolicy {
            budgets: vec![Budget::new(raw)],
            ..DisruptionPolicy::default()
        })
    }

    #[test_case("10%", 10, 0, 1 ; "ten percent of ten")]
    #[test_case("10%", 15, 0, 2 ; "rounds up")]
    #[test_case("2", 10, 1, 1 ; "in progress counts")]
    #[test_case("0", 10, 0, 0 ; "zero blocks")]
    #[test_case("bogus", 10, 0, 0 ; "malformed blocks")]
    fn remaining_budget(raw: &str, nodes: usize, disrupting: usize, expected: usize) {
        let pool = pool_with_budget(raw);
        let tracker = BudgetTracker::new(&ctx(nodes, pool.clone(), disrupting), BudgetRounding::Up);
        assert_eq!(tracker.remaining(&pool, DisruptionMethod::Emptiness), expected);
    }

    #[test]
    fn takes_are_charged_within_a_pass() {
        let pool = pool_with_budget("2");
        let mut tracker = BudgetTracker::new(&ctx(5, pool.clone(), 0), BudgetRounding::Up);
        assert!(tracker.try_take(&pool, DisruptionMethod::Drift, 1));
        assert!(!tracker.try_take(&pool, DisruptionMethod::Drift, 2));
        assert!(tracker.try_take(&pool, DisruptionMethod::Drift, 1));
        assert_eq!(tracker.remaining(&pool, DisruptionMethod::Drift), 0);
    }
}
