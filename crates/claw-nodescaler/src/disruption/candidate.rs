//! Disruption candidates.
//!
//! A candidate is a `Ready` claim whose node is in the snapshot, whose pool
//! still exists and which nothing on the node protects. Candidates are
//! ordered by disruption cost, cheapest first.

use chrono::{DateTime, Utc};
use claw_provisioning::{Node, NodePool, Pod, PodKey};
use serde::Serialize;
use tracing::debug;

use crate::cluster::PodDisruptionBudget;
use crate::context::ReconcileContext;
use crate::lifecycle::{ClaimPhase, ConditionKind, NodeClaim, NodeClaimStore};

/// Priorities are scaled into `[-1, 1]` by this factor before being added
/// to a pod's base eviction cost.
const PRIORITY_SCALE: f64 = 33_554_432.0;

/// A node that may be disrupted.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The backing claim, as captured.
    pub claim: NodeClaim,
    /// Node name.
    pub node: String,
    /// Owning pool.
    pub nodepool: String,
    /// Workload pods on the node: everything except daemonset pods.
    pub pods: Vec<PodKey>,
    /// Hourly price of the node.
    pub price: f64,
    /// Relative cost of evicting the node's pods.
    pub disruption_cost: f64,
}

impl Candidate {
    /// Returns true if no workload pod runs on the node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

/// Why a node cannot be voluntarily disrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockReason {
    /// The claim's pool no longer exists.
    NodePoolMissing {
        /// Pool name.
        nodepool: String,
    },
    /// A pod opted out of voluntary disruption.
    DoNotDisrupt {
        /// The pod.
        pod: String,
    },
    /// A pod cannot be evicted at all.
    NotEvictable {
        /// The pod.
        pod: String,
    },
    /// A pod disruption budget allows no evictions.
    DisruptionBudget {
        /// The pod.
        pod: String,
        /// `namespace/name` of the budget.
        budget: String,
    },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodePoolMissing { nodepool } => write!(f, "nodepool {nodepool} not found"),
            Self::DoNotDisrupt { pod } => write!(f, "pod {pod} opted out of disruption"),
            Self::NotEvictable { pod } => write!(f, "pod {pod} cannot be evicted"),
            Self::DisruptionBudget { pod, budget } => {
                write!(f, "budget {budget} allows no evictions of pod {pod}")
            }
        }
    }
}

/// A node excluded from disruption this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocked {
    /// Node name.
    pub node: String,
    /// Why.
    pub reason: BlockReason,
}

/// Why `pod` would prevent its node from being voluntarily disrupted.
#[must_use]
pub fn blocking_reason(pod: &Pod, pdbs: &[PodDisruptionBudget]) -> Option<BlockReason> {
    if pod.do_not_disrupt() {
        return Some(BlockReason::DoNotDisrupt {
            pod: pod.key().to_string(),
        });
    }
    if pod.is_mirror() {
        return Some(BlockReason::NotEvictable {
            pod: pod.key().to_string(),
        });
    }
    pdbs.iter()
        .find(|pdb| pdb.disruptions_allowed == 0 && pdb.covers(pod))
        .map(|pdb| BlockReason::DisruptionBudget {
            pod: pod.key().to_string(),
            budget: format!("{}/{}", pdb.namespace, pdb.name),
        })
}

/// Eviction cost of a single pod: one, shifted by its priority.
#[must_use]
pub fn eviction_cost(pod: &Pod) -> f64 {
    1.0 + (f64::from(pod.priority) / PRIORITY_SCALE).clamp(-1.0, 1.0)
}

/// Cost of disrupting a node holding `pods`. Nodes close to expiry are
/// cheaper to disrupt since they are going away soon anyway.
#[must_use]
pub fn disruption_cost<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
    claim: &NodeClaim,
    pool: &NodePool,
    now: DateTime<Utc>,
) -> f64 {
    let base: f64 = pods.into_iter().map(eviction_cost).sum();
    let lifetime = match pool.disruption.expire_after_secs {
        Some(ttl) if ttl > 0 => {
            let age = (now - claim.created_at).num_seconds().max(0);
            #[allow(clippy::cast_precision_loss)]
            let remaining = (ttl as f64 - age as f64) / ttl as f64;
            remaining.clamp(0.0, 1.0)
        }
        _ => 1.0,
    };
    base * lifetime
}

/// Why `node` no longer matches `pool`, if it does not.
#[must_use]
pub fn drift_reason(claim: &NodeClaim, pool: &NodePool, node: &Node) -> Option<String> {
    if !claim.nodepool_hash.is_empty() && claim.nodepool_hash != pool.hash() {
        return Some("nodepool template changed".to_string());
    }
    node.requirements()
        .conflict(&pool.requirements)
        .map(|c| format!("node no longer satisfies nodepool: {c}"))
}

/// Collects candidates and blocked nodes from `ctx`, cheapest first.
#[must_use]
pub fn candidates(ctx: &ReconcileContext, now: DateTime<Utc>) -> (Vec<Candidate>, Vec<Blocked>) {
    let mut found = Vec::new();
    let mut blocked = Vec::new();

    for claim in ctx.claims.iter().filter(|c| c.phase == ClaimPhase::Ready) {
        let Some(node_name) = claim.node_name.as_deref() else {
            continue;
        };
        let Some(state_node) = ctx.state.node(node_name) else {
            continue;
        };
        if state_node.node.is_disrupted() {
            continue;
        }
        let Some(pool) = ctx.nodepool(&claim.nodepool) else {
            blocked.push(Blocked {
                node: node_name.to_string(),
                reason: BlockReason::NodePoolMissing {
                    nodepool: claim.nodepool.clone(),
                },
            });
            continue;
        };

        let pods: Vec<&Pod> = ctx
            .state
            .pods_on(node_name)
            .filter(|p| !p.is_daemonset() && !p.is_terminal())
            .collect();
        if let Some(reason) = pods.iter().find_map(|p| blocking_reason(p, &ctx.pdbs)) {
            debug!(node = node_name, reason = %reason, "node blocked from disruption");
            blocked.push(Blocked {
                node: node_name.to_string(),
                reason,
            });
            continue;
        }

        found.push(Candidate {
            claim: claim.clone(),
            node: node_name.to_string(),
            nodepool: claim.nodepool.clone(),
            pods: pods.iter().map(|p| p.key()).collect(),
            price: claim.price(),
            disruption_cost: disruption_cost(pods.iter().copied(), claim, pool, now),
        });
    }

    found.sort_by(|a, b| {
        a.disruption_cost
            .total_cmp(&b.disruption_cost)
            .then_with(|| a.node.cmp(&b.node))
    });
    (found, blocked)
}

/// Refreshes the `Empty` and `Drifted` conditions of every `Ready` claim.
/// Returns the number of claims whose conditions were touched.
pub fn mark_conditions(store: &NodeClaimStore, ctx: &ReconcileContext, now: DateTime<Utc>) -> usize {
    let mut touched = 0;
    for claim in ctx.claims.iter().filter(|c| c.phase == ClaimPhase::Ready) {
        let Some(node_name) = claim.node_name.as_deref() else {
            continue;
        };
        let Some(state_node) = ctx.state.node(node_name) else {
            continue;
        };
        let empty = !ctx
            .state
            .pods_on(node_name)
            .any(|p| !p.is_daemonset() && !p.is_terminal());
        let drift = ctx
            .nodepool(&claim.nodepool)
            .and_then(|pool| drift_reason(claim, pool, &state_node.node));

        let updated = store.update(claim.id, |c| {
            if empty {
                c.set_condition(ConditionKind::Empty, true, "node has no workload pods", now);
            } else {
                c.clear_condition(ConditionKind::Empty);
            }
            match &drift {
                Some(reason) => c.set_condition(ConditionKind::Drifted, true, reason.clone(), now),
                None => c.clear_condition(ConditionKind::Drifted),
            }
        });
        if updated.is_ok() {
            touched += 1;
        }
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::claim;
    use chrono::Duration as ChronoDuration;
    use claw_provisioning::pod::ANNOTATION_DO_NOT_DISRUPT;
    use claw_provisioning::requirements::{LABEL_ARCH, LABEL_NODEPOOL};
    use claw_provisioning::{
        ClusterState, DisruptionPolicy, LabelSelector, OfferingCatalog, Requirement, Resources,
    };

    fn node(name: &str) -> Node {
        Node::new(name)
            .with_label(LABEL_NODEPOOL, "default")
            .with_allocatable(Resources::new().with_cpu(4).with_pods(110))
    }

    fn ready(name: &str) -> NodeClaim {
        let mut c = claim(name, "default", ClaimPhase::Ready);
        c.node_name = Some(name.to_string());
        c
    }

    fn web(name: &str, node: &str) -> Pod {
        Pod::new("default", name)
            .with_label("app", "web")
            .with_owner("ReplicaSet", "web")
            .with_requests(Resources::new().with_cpu(1))
            .bound_to(node)
    }

    fn ctx(pods: Vec<Pod>, claims: Vec<NodeClaim>) -> ReconcileContext {
        ReconcileContext::new(
            ClusterState::snapshot(vec![node("a"), node("b")], pods, Vec::new()),
            OfferingCatalog::new(),
            vec![NodePool::new("default")],
        )
        .with_claims(claims)
    }

    #[test]
    fn cheaper_nodes_come_first() {
        let ctx = ctx(
            vec![web("w1", "a"), web("w2", "a"), web("w3", "b")],
            vec![ready("a"), ready("b")],
        );
        let (found, blocked) = candidates(&ctx, Utc::now());
        assert!(blocked.is_empty());
        let order: Vec<&str> = found.iter().map(|c| c.node.as_str()).collect();
        assert_eq!(order, ["b", "a"]);
        assert_eq!(found[1].pods.len(), 2);
    }

    #[test]
    fn protected_pods_block_their_node() {
        let guarded = web("w1", "a").with_annotation(ANNOTATION_DO_NOT_DISRUPT, "true");
        let ctx = ctx(vec![guarded], vec![ready("a"), ready("b")]);
        let (found, blocked) = candidates(&ctx, Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(blocked[0].node, "a");
        assert!(matches!(blocked[0].reason, BlockReason::DoNotDisrupt { .. }));
    }

    #[test]
    fn exhausted_pdbs_block_their_node() {
        let ctx = ctx(vec![web("w1", "a")], vec![ready("a")]).with_pdbs(vec![
            PodDisruptionBudget::new("default", "web", LabelSelector::label("app", "web"), 0),
        ]);
        let (found, blocked) = candidates(&ctx, Utc::now());
        assert!(found.is_empty());
        assert_eq!(
            blocked[0].reason.to_string(),
            "budget default/web allows no evictions of pod default/w1"
        );
    }

    #[test]
    fn claims_without_a_pool_are_blocked() {
        let mut orphan = ready("b");
        orphan.nodepool = "gone".into();
        let (found, blocked) = candidates(&ctx(Vec::new(), vec![ready("a"), orphan]), Utc::now());
        assert_eq!(found.len(), 1);
        assert!(matches!(blocked[0].reason, BlockReason::NodePoolMissing { .. }));
    }

    #[test]
    fn expiring_nodes_cost_less() {
        let pool = NodePool::new("default").with_disruption(DisruptionPolicy {
            expire_after_secs: Some(1000),
            ..DisruptionPolicy::default()
        });
        let pods = [web("w1", "a")];
        let mut c = ready("a");
        let now = Utc::now();
        c.created_at = now - ChronoDuration::seconds(750);
        let cost = disruption_cost(pods.iter(), &c, &pool, now);
        assert!((cost - 0.25).abs() < 1e-9);

        let fresh = disruption_cost(pods.iter(), &ready("a"), &NodePool::new("default"), now);
        assert!((fresh - 1.0).abs() < 1e-9);
    }

    #[test]
    fn priority_shifts_eviction_cost() {
        let mut high = web("w1", "a");
        high.priority = 1_000_000_000;
        let mut low = web("w2", "a");
        low.priority = -1_000_000_000;
        assert!((eviction_cost(&high) - 2.0).abs() < 1e-9);
        assert!(eviction_cost(&low).abs() < 1e-9);
    }

    #[test]
    fn drift_follows_hash_and_requirements() {
        let pool = NodePool::new("default");
        let mut c = ready("a");
        c.nodepool_hash = pool.hash();
        assert_eq!(drift_reason(&c, &pool, &node("a")), None);

        c.nodepool_hash = "stale".into();
        assert_eq!(
            drift_reason(&c, &pool, &node("a")).as_deref(),
            Some("nodepool template changed")
        );

        c.nodepool_hash = String::new();
        let arm = NodePool::new("default").with_requirement(Requirement::in_values(LABEL_ARCH, ["arm64"]));
        let amd = node("a").with_label(LABEL_ARCH, "amd64");
        assert!(drift_reason(&c, &arm, &amd).is_some());
    }

    #[test]
    fn conditions_track_emptiness() {
        let store = NodeClaimStore::new();
        let a = store.insert(ready("a")).expect("insert");
        let b = store.insert(ready("b")).expect("insert");
        let now = Utc::now();

        let busy = ctx(vec![web("w1", "a")], store.list());
        assert_eq!(mark_conditions(&store, &busy, now), 2);
        assert!(!store.get(a).is_some_and(|c| c.is_condition_true(ConditionKind::Empty)));
        assert!(store.get(b).is_some_and(|c| c.is_condition_true(ConditionKind::Empty)));

        let later = now + ChronoDuration::seconds(60);
        let moved = ctx(vec![web("w1", "b")], store.list());
        mark_conditions(&store, &moved, later);
        assert!(store.get(b).is_some_and(|c| c.condition(ConditionKind::Empty).is_none()));
        let since = store
            .get(a)
            .and_then(|c| c.true_for(ConditionKind::Empty, later))
            .expect("empty");
        assert_eq!(since, ChronoDuration::zero());
    }
}
