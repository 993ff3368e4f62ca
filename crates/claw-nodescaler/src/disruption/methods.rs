//! Disruption planning.
//!
//! Each candidate is assigned the first actionable method in priority order
//! (expiration, drift, emptiness, consolidation). Every proposed command is
//! validated against a projection of the cluster with the command's nodes
//! removed and its replacements launched, and the projection carries over to
//! the next command so that one pass never double-books capacity.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use claw_provisioning::{
    ClusterState, ConsolidationPolicy, DisruptionMethod, Node, NodeClaimTemplate, NodePool, Pod,
    PodKey, PlacementTarget, SchedulingResults, simulate_with,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::budgets::BudgetTracker;
use super::candidate::{Blocked, Candidate, candidates, drift_reason};
use crate::config::DisruptionConfig;
use crate::context::{ReconcileContext, launching_node};
use crate::lifecycle::{ClaimId, ConditionKind};

/// Identity of a disruption command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Creates a fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node a command removes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandTarget {
    /// Backing claim.
    pub claim: ClaimId,
    /// Node name.
    pub node: String,
    /// Owning pool.
    pub nodepool: String,
    /// Hourly price.
    pub price: f64,
}

/// A validated decision to remove nodes, optionally launching replacements
/// first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Identity.
    pub id: CommandId,
    /// Why the nodes go.
    pub method: DisruptionMethod,
    /// Nodes removed.
    pub targets: Vec<CommandTarget>,
    /// Nodes launched before the targets are drained.
    pub replacements: Vec<NodeClaimTemplate>,
    /// Human-readable explanation.
    pub reason: String,
}

impl Command {
    pub(crate) fn new(
        method: DisruptionMethod,
        targets: &[&Candidate],
        replacements: Vec<NodeClaimTemplate>,
        reason: String,
    ) -> Self {
        Self {
            id: CommandId::new(),
            method,
            targets: targets
                .iter()
                .map(|c| CommandTarget {
                    claim: c.claim.id,
                    node: c.node.clone(),
                    nodepool: c.nodepool.clone(),
                    price: c.price,
                })
                .collect(),
            replacements,
            reason,
        }
    }

    /// Names of the nodes removed.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.node.clone()).collect()
    }

    /// Claims removed.
    #[must_use]
    pub fn claim_ids(&self) -> Vec<ClaimId> {
        self.targets.iter().map(|t| t.claim).collect()
    }

    /// Returns true if nothing is launched in place of the targets.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.replacements.is_empty()
    }

    /// Hourly price of the removed nodes.
    #[must_use]
    pub fn removed_price(&self) -> f64 {
        self.targets.iter().map(|t| t.price).sum()
    }

    /// Hourly price of the replacements.
    #[must_use]
    pub fn replacement_price(&self) -> f64 {
        self.replacements.iter().map(NodeClaimTemplate::price).sum()
    }

    /// Hourly savings; negative when replacing costs more.
    #[must_use]
    pub fn savings(&self) -> f64 {
        self.removed_price() - self.replacement_price()
    }
}

/// A candidate held back by its pool's budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deferred {
    /// Node name.
    pub node: String,
    /// Owning pool.
    pub nodepool: String,
    /// Method that would have applied.
    pub method: DisruptionMethod,
}

/// A proposal that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    /// Nodes proposed.
    pub nodes: Vec<String>,
    /// Method proposed.
    pub method: DisruptionMethod,
    /// Why it was rejected.
    pub reason: String,
}

/// Outcome of planning one disruption pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisruptionPlan {
    /// Commands to execute, in priority order.
    pub commands: Vec<Command>,
    /// Candidates waiting on a budget.
    pub deferred: Vec<Deferred>,
    /// Nodes protected by their pods or missing a pool.
    pub blocked: Vec<Blocked>,
    /// Proposals that would have stranded pods or not saved money.
    pub rejected: Vec<Rejected>,
}

impl DisruptionPlan {
    /// Returns true if no command was produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// The result of simulating a set of nodes away.
struct Validation {
    state: ClusterState,
    displaced: Vec<Pod>,
    results: SchedulingResults,
    replacements: BTreeSet<usize>,
}

impl Validation {
    fn templates(&self) -> Vec<NodeClaimTemplate> {
        self.results
            .node_claims
            .iter()
            .enumerate()
            .filter(|(i, _)| self.replacements.contains(i))
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn replacement_price(&self) -> f64 {
        self.templates().iter().map(NodeClaimTemplate::price).sum()
    }
}

/// Cluster state as it will be once the accepted commands have run.
struct Projection {
    state: ClusterState,
    launched: usize,
}

impl Projection {
    fn remove(&mut self, nodes: &[String]) {
        self.state = self.state.without_nodes(nodes).0;
    }

    fn apply(&mut self, validation: Validation, ctx: &ReconcileContext) {
        let mut names: BTreeMap<usize, String> = BTreeMap::new();
        let mut launching = Vec::new();
        for (i, template) in validation
            .results
            .node_claims
            .iter()
            .enumerate()
            .filter(|(i, _)| validation.replacements.contains(i))
        {
            self.launched += 1;
            let name = format!("{}-replacement-{}", template.nodepool, self.launched);
            if let Some(node) = replacement_node(&name, template, ctx) {
                names.insert(i, name);
                launching.push(node);
            }
        }

        let rebound: Vec<Pod> = validation
            .displaced
            .into_iter()
            .map(|pod| match validation.results.target_of(&pod.key()) {
                Some(PlacementTarget::ExistingNode(node)) => pod.bound_to(node.clone()),
                Some(PlacementTarget::NewClaim(i)) => match names.get(i) {
                    Some(node) => pod.bound_to(node.clone()),
                    None => pod,
                },
                None => pod,
            })
            .collect();
        self.state = validation.state.with_projected(launching, rebound);
    }
}

fn replacement_node(name: &str, template: &NodeClaimTemplate, ctx: &ReconcileContext) -> Option<Node> {
    let pool = ctx.nodepool(&template.nodepool)?;
    let instance = ctx
        .catalog
        .instance_type(&template.nodepool, &template.offering.instance_type)?;
    let allocatable = instance
        .allocatable(pool.template.kubelet.max_pods)
        .saturating_sub(&template.daemon_overhead);
    Some(launching_node(
        name,
        &template.nodepool,
        &template.requirements,
        (instance.capacity, allocatable),
        &template.taints,
    ))
}

fn secs(d: ChronoDuration) -> u64 {
    u64::try_from(d.num_seconds()).unwrap_or(0)
}

/// Decides which nodes to disrupt in one pass. Planning has no side effects.
#[derive(Debug)]
pub struct Planner<'a> {
    ctx: &'a ReconcileContext,
    config: &'a DisruptionConfig,
    now: DateTime<Utc>,
}

impl<'a> Planner<'a> {
    /// Creates a planner evaluating `ctx` as of `now`.
    #[must_use]
    pub const fn new(ctx: &'a ReconcileContext, config: &'a DisruptionConfig, now: DateTime<Utc>) -> Self {
        Self { ctx, config, now }
    }

    /// Produces the commands for this pass.
    #[must_use]
    pub fn plan(&self) -> DisruptionPlan {
        let (found, blocked) = candidates(self.ctx, self.now);
        let mut plan = DisruptionPlan {
            blocked,
            ..DisruptionPlan::default()
        };
        if found.is_empty() {
            return plan;
        }

        let mut budgets = BudgetTracker::new(self.ctx, self.config.budget_rounding);
        let mut projection = Projection {
            state: (*self.ctx.state).clone(),
            launched: 0,
        };
        let baseline: BTreeSet<PodKey> = self
            .simulate(&projection.state, &[])
            .unschedulable
            .into_keys()
            .collect();

        let mut by_method: BTreeMap<DisruptionMethod, Vec<(&Candidate, String)>> = BTreeMap::new();
        for candidate in &found {
            if let Some((method, reason)) = self.method_for(candidate) {
                by_method.entry(method).or_default().push((candidate, reason));
            }
        }

        for (method, list) in by_method {
            match method {
                DisruptionMethod::Expiration | DisruptionMethod::Drift => {
                    self.replace_each(method, list, &baseline, &mut budgets, &mut projection, &mut plan);
                }
                DisruptionMethod::Emptiness => {
                    self.delete_empty(list, &mut budgets, &mut projection, &mut plan);
                }
                DisruptionMethod::Consolidation => {
                    self.consolidate(list, &baseline, &mut budgets, &mut projection, &mut plan);
                }
                DisruptionMethod::Interruption => {}
            }
        }

        debug!(
            commands = plan.commands.len(),
            deferred = plan.deferred.len(),
            blocked = plan.blocked.len(),
            rejected = plan.rejected.len(),
            "disruption plan computed"
        );
        plan
    }

    /// The first actionable method for `candidate`, with its reason.
    fn method_for(&self, candidate: &Candidate) -> Option<(DisruptionMethod, String)> {
        let pool = self.ctx.nodepool(&candidate.nodepool)?;
        let claim = &candidate.claim;
        for method in DisruptionMethod::VOLUNTARY {
            if !self.config.allows(method) {
                continue;
            }
            let reason = match method {
                DisruptionMethod::Expiration => pool
                    .disruption
                    .expire_after_secs
                    .filter(|ttl| secs(self.now - claim.created_at) >= *ttl)
                    .map(|ttl| format!("node older than {ttl}s")),
                DisruptionMethod::Drift => self
                    .ctx
                    .state
                    .node(&candidate.node)
                    .and_then(|n| drift_reason(claim, pool, &n.node)),
                DisruptionMethod::Emptiness => claim
                    .true_for(ConditionKind::Empty, self.now)
                    .filter(|d| candidate.is_empty() && secs(*d) >= pool.disruption.consolidate_after_secs)
                    .map(|d| format!("node empty for {}s", secs(d))),
                DisruptionMethod::Consolidation => self
                    .consolidatable(candidate, pool)
                    .then(|| "node underutilized".to_string()),
                DisruptionMethod::Interruption => None,
            };
            if let Some(reason) = reason {
                return Some((method, reason));
            }
        }
        None
    }

    fn consolidatable(&self, candidate: &Candidate, pool: &NodePool) -> bool {
        if pool.disruption.consolidation_policy != ConsolidationPolicy::WhenEmptyOrUnderutilized
            || candidate.is_empty()
        {
            return false;
        }
        let claim = &candidate.claim;
        let ready_since = claim
            .condition(ConditionKind::Ready)
            .filter(|c| c.status)
            .map_or(claim.created_at, |c| c.last_transition);
        secs(self.now - ready_since) >= pool.disruption.consolidate_after_secs
    }

    fn simulate(&self, state: &ClusterState, displaced: &[Pod]) -> SchedulingResults {
        let mut pending = state.pending_pods();
        pending.extend_from_slice(displaced);
        simulate_with(
            &pending,
            state,
            &self.ctx.catalog,
            &self.ctx.nodepools,
            &self.ctx.policy,
        )
    }

    /// Simulates `candidates` away. Fails if a pod that schedules today
    /// would not schedule afterwards.
    fn validate(
        &self,
        state: &ClusterState,
        candidates: &[&Candidate],
        baseline: &BTreeSet<PodKey>,
    ) -> Result<Validation, String> {
        let names: Vec<String> = candidates.iter().map(|c| c.node.clone()).collect();
        let (after, displaced) = state.without_nodes(&names);
        let results = self.simulate(&after, &displaced);
        if let Some((pod, reason)) = results
            .unschedulable
            .iter()
            .find(|(k, _)| !baseline.contains(*k))
        {
            return Err(format!("pod {pod} would become unschedulable: {reason}"));
        }
        let moved: BTreeSet<PodKey> = displaced.iter().map(Pod::key).collect();
        let replacements = results
            .node_claims
            .iter()
            .enumerate()
            .filter(|(_, t)| t.pods.iter().any(|k| moved.contains(k)))
            .map(|(i, _)| i)
            .collect();
        Ok(Validation {
            state: after,
            displaced,
            results,
            replacements,
        })
    }

    /// Expiration and drift: one command per node, replacements allowed.
    fn replace_each(
        &self,
        method: DisruptionMethod,
        list: Vec<(&Candidate, String)>,
        baseline: &BTreeSet<PodKey>,
        budgets: &mut BudgetTracker,
        projection: &mut Projection,
        plan: &mut DisruptionPlan,
    ) {
        for (candidate, reason) in list {
            let Some(pool) = self.ctx.nodepool(&candidate.nodepool) else {
                continue;
            };
            if budgets.remaining(pool, method) == 0 {
                plan.deferred.push(deferred(candidate, method));
                continue;
            }
            match self.validate(&projection.state, &[candidate], baseline) {
                Ok(validation) => {
                    budgets.try_take(pool, method, 1);
                    let command = Command::new(method, &[candidate], validation.templates(), reason);
                    projection.apply(validation, self.ctx);
                    plan.commands.push(command);
                }
                Err(why) => plan.rejected.push(Rejected {
                    nodes: vec![candidate.node.clone()],
                    method,
                    reason: why,
                }),
            }
        }
    }

    /// Emptiness: one batched delete per pool.
    fn delete_empty(
        &self,
        list: Vec<(&Candidate, String)>,
        budgets: &mut BudgetTracker,
        projection: &mut Projection,
        plan: &mut DisruptionPlan,
    ) {
        let mut per_pool: BTreeMap<&str, Vec<(&Candidate, String)>> = BTreeMap::new();
        for (candidate, reason) in list {
            per_pool
                .entry(candidate.nodepool.as_str())
                .or_default()
                .push((candidate, reason));
        }

        for (name, list) in per_pool {
            let Some(pool) = self.ctx.nodepool(name) else {
                continue;
            };
            let n = budgets
                .remaining(pool, DisruptionMethod::Emptiness)
                .min(list.len());
            let (take, defer) = list.split_at(n);
            plan.deferred.extend(
                defer
                    .iter()
                    .map(|(c, _)| deferred(c, DisruptionMethod::Emptiness)),
            );
            let Some((_, reason)) = take.first() else {
                continue;
            };
            budgets.try_take(pool, DisruptionMethod::Emptiness, n);
            // Empty nodes hold no reschedulable pods, so no what-if simulation is needed.
            let targets: Vec<&Candidate> = take.iter().map(|(c, _)| *c).collect();
            let command = Command::new(DisruptionMethod::Emptiness, &targets, Vec::new(), reason.clone());
            projection.remove(&command.nodes());
            plan.commands.push(command);
        }
    }

    /// Consolidation: at most one command, trying the largest removable
    /// prefix of candidates before single nodes.
    fn consolidate(
        &self,
        list: Vec<(&Candidate, String)>,
        baseline: &BTreeSet<PodKey>,
        budgets: &mut BudgetTracker,
        projection: &mut Projection,
        plan: &mut DisruptionPlan,
    ) {
        let mut allowance: BTreeMap<String, usize> = BTreeMap::new();
        let mut eligible: Vec<&Candidate> = Vec::new();
        for (candidate, _) in list {
            let Some(pool) = self.ctx.nodepool(&candidate.nodepool) else {
                continue;
            };
            let left = allowance
                .entry(candidate.nodepool.clone())
                .or_insert_with(|| budgets.remaining(pool, DisruptionMethod::Consolidation));
            if *left == 0 {
                plan.deferred
                    .push(deferred(candidate, DisruptionMethod::Consolidation));
                continue;
            }
            *left -= 1;
            eligible.push(candidate);
        }

        let mut chosen: Option<(Vec<&Candidate>, Validation)> = None;
        let cap = self.config.max_multi_node_candidates.min(eligible.len());
        if cap >= 2 {
            let (mut lo, mut hi) = (2, cap);
            while lo <= hi {
                let mid = lo + (hi - lo) / 2;
                match self.cheaper_without(&projection.state, &eligible[..mid], baseline) {
                    Ok(validation) => {
                        chosen = Some((eligible[..mid].to_vec(), validation));
                        lo = mid + 1;
                    }
                    Err(why) => {
                        debug!(nodes = mid, reason = %why, "multi-node consolidation rejected");
                        hi = mid - 1;
                    }
                }
            }
        }
        if chosen.is_none() {
            for candidate in &eligible {
                match self.cheaper_without(&projection.state, &[*candidate], baseline) {
                    Ok(validation) => {
                        chosen = Some((vec![*candidate], validation));
                        break;
                    }
                    Err(why) => plan.rejected.push(Rejected {
                        nodes: vec![candidate.node.clone()],
                        method: DisruptionMethod::Consolidation,
                        reason: why,
                    }),
                }
            }
        }

        let Some((targets, validation)) = chosen else {
            return;
        };
        for candidate in &targets {
            if let Some(pool) = self.ctx.nodepool(&candidate.nodepool) {
                budgets.try_take(pool, DisruptionMethod::Consolidation, 1);
            }
        }
        let replacements = validation.templates();
        let reason = match replacements.first() {
            Some(r) => format!(
                "replace {} node(s) with {} at {:.4}/h",
                targets.len(),
                r.offering.instance_type,
                r.price()
            ),
            None => format!("pods of {} node(s) fit on remaining capacity", targets.len()),
        };
        let command = Command::new(DisruptionMethod::Consolidation, &targets, replacements, reason);
        projection.apply(validation, self.ctx);
        plan.commands.push(command);
    }

    /// Validates removing `candidates` and requires the result to be
    /// strictly cheaper with at most one replacement.
    fn cheaper_without(
        &self,
        state: &ClusterState,
        candidates: &[&Candidate],
        baseline: &BTreeSet<PodKey>,
    ) -> Result<Validation, String> {
        let validation = self.validate(state, candidates, baseline)?;
        if validation.replacements.len() > 1 {
            return Err(format!(
                "needs {} replacement nodes",
                validation.replacements.len()
            ));
        }
        let removed: f64 = candidates.iter().map(|c| c.price).sum();
        let replacement = validation.replacement_price();
        if replacement >= removed {
            return Err(format!(
                "replacement costs {replacement:.4}/h, not less than {removed:.4}/h"
            ));
        }
        Ok(validation)
    }
}

fn deferred(candidate: &Candidate, method: DisruptionMethod) -> Deferred {
    Deferred {
        node: candidate.node.clone(),
        nodepool: candidate.nodepool.clone(),
        method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::claim;
    use crate::lifecycle::{ClaimPhase, NodeClaim};
    use claw_provisioning::requirements::LABEL_NODEPOOL;
    use claw_provisioning::{
        Budget, CapacityType, DisruptionPolicy, InstanceType, OfferingCatalog, Resources,
    };

    fn pool() -> NodePool {
        NodePool::new("default").with_disruption(DisruptionPolicy {
            budgets: vec![Budget::new("100%")],
            ..DisruptionPolicy::default()
        })
    }

    fn medium_node(name: &str) -> Node {
        Node::new(name)
            .with_label(LABEL_NODEPOOL, "default")
            .with_allocatable(Resources::new().with_cpu(4).with_memory_gib(16).with_pods(110))
    }

    fn ready(name: &str, price: f64) -> NodeClaim {
        let mut c = claim(name, "default", ClaimPhase::Ready);
        c.node_name = Some(name.to_string());
        c.offering.price = price;
        c
    }

    fn pod(name: &str, cpu: u64, node: &str) -> Pod {
        Pod::new("default", name)
            .with_owner("ReplicaSet", "web")
            .with_requests(Resources::new().with_cpu(cpu))
            .bound_to(node)
    }

    fn catalog(pool: &NodePool, types: Vec<InstanceType>) -> OfferingCatalog {
        let mut catalog = OfferingCatalog::new();
        catalog.insert(pool, types.into_iter().map(InstanceType::normalized).collect());
        catalog
    }

    fn medium() -> InstanceType {
        InstanceType::new("medium", Resources::new().with_cpu(4).with_memory_gib(16))
            .with_offering("zone-a", CapacityType::OnDemand, 0.1)
    }

    fn small() -> InstanceType {
        InstanceType::new("small", Resources::new().with_cpu(2).with_memory_gib(8))
            .with_offering("zone-a", CapacityType::OnDemand, 0.05)
    }

    fn ctx(
        pool: NodePool,
        types: Vec<InstanceType>,
        nodes: &[&str],
        pods: Vec<Pod>,
        claims: Vec<NodeClaim>,
    ) -> ReconcileContext {
        let catalog = catalog(&pool, types);
        ReconcileContext::new(
            ClusterState::snapshot(nodes.iter().map(|n| medium_node(n)).collect(), pods, Vec::new()),
            catalog,
            vec![pool],
        )
        .with_claims(claims)
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(1)
    }

    fn empty_since(mut c: NodeClaim, since: DateTime<Utc>) -> NodeClaim {
        c.set_condition(ConditionKind::Empty, true, "node has no workload pods", since);
        c
    }

    #[test]
    fn empty_nodes_past_grace_are_deleted() {
        let now = Utc::now();
        let ctx = ctx(
            pool(),
            vec![medium()],
            &["a", "b"],
            vec![pod("w1", 1, "b")],
            vec![
                empty_since(ready("a", 0.1), now - ChronoDuration::seconds(60)),
                ready("b", 0.1),
            ],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, now).plan();

        assert_eq!(plan.commands.len(), 1);
        let command = &plan.commands[0];
        assert_eq!(command.method, DisruptionMethod::Emptiness);
        assert_eq!(command.nodes(), ["a"]);
        assert!(command.is_delete());
    }

    #[test]
    fn empty_nodes_within_grace_are_left_alone() {
        let now = Utc::now();
        let ctx = ctx(
            pool(),
            vec![medium()],
            &["a"],
            Vec::new(),
            vec![empty_since(ready("a", 0.1), now - ChronoDuration::seconds(10))],
        );
        let config = DisruptionConfig::default();
        assert!(Planner::new(&ctx, &config, now).plan().is_empty());
    }

    #[test]
    fn empty_deletes_respect_the_budget() {
        let now = Utc::now();
        let since = now - ChronoDuration::minutes(5);
        let limited = NodePool::new("default").with_disruption(DisruptionPolicy {
            budgets: vec![Budget::new("1")],
            ..DisruptionPolicy::default()
        });
        let ctx = ctx(
            limited,
            vec![medium()],
            &["a", "b", "c"],
            Vec::new(),
            vec![
                empty_since(ready("a", 0.1), since),
                empty_since(ready("b", 0.1), since),
                empty_since(ready("c", 0.1), since),
            ],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, now).plan();

        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].targets.len(), 1);
        assert_eq!(plan.deferred.len(), 2);
    }

    #[test]
    fn pods_fitting_elsewhere_allow_a_plain_delete() {
        let ctx = ctx(
            pool(),
            vec![medium()],
            &["a", "b"],
            vec![pod("w1", 1, "a"), pod("w2", 2, "b")],
            vec![ready("a", 0.1), ready("b", 0.1)],
        );
        let config = DisruptionConfig {
            max_multi_node_candidates: 1,
            ..DisruptionConfig::default()
        };
        let plan = Planner::new(&ctx, &config, later()).plan();

        assert_eq!(plan.commands.len(), 1);
        let command = &plan.commands[0];
        assert_eq!(command.method, DisruptionMethod::Consolidation);
        assert_eq!(command.nodes(), ["a"]);
        assert!(command.is_delete());
        assert!((command.savings() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn underutilized_nodes_are_merged() {
        let ctx = ctx(
            pool(),
            vec![medium()],
            &["a", "b", "c"],
            vec![pod("w1", 3, "a"), pod("w2", 3, "b"), pod("w3", 1, "c")],
            vec![ready("a", 0.1), ready("b", 0.1), ready("c", 0.1)],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, later()).plan();

        assert_eq!(plan.commands.len(), 1);
        let command = &plan.commands[0];
        assert!(command.targets.len() >= 2);
        assert!(command.replacements.len() <= 1);
        assert!(command.savings() > 0.0);
    }

    #[test]
    fn replacement_must_be_strictly_cheaper() {
        let ctx = ctx(
            pool(),
            vec![medium()],
            &["a"],
            vec![pod("w1", 3, "a")],
            vec![ready("a", 0.1)],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, later()).plan();

        assert!(plan.commands.is_empty());
        assert_eq!(plan.rejected.len(), 1);
        assert!(plan.rejected[0].reason.contains("not less than"));
    }

    #[test]
    fn cheaper_replacements_are_accepted() {
        let ctx = ctx(
            pool(),
            vec![medium(), small()],
            &["a"],
            vec![pod("w1", 1, "a")],
            vec![ready("a", 0.4)],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, later()).plan();

        assert_eq!(plan.commands.len(), 1);
        let command = &plan.commands[0];
        assert_eq!(command.replacements.len(), 1);
        assert_eq!(command.replacements[0].offering.instance_type, "small");
        assert!((command.savings() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn expired_nodes_come_before_consolidation() {
        let expiring = NodePool::new("default").with_disruption(DisruptionPolicy {
            expire_after_secs: Some(3600),
            budgets: vec![Budget::new("100%")],
            ..DisruptionPolicy::default()
        });
        let now = Utc::now();
        let mut old = ready("a", 0.1);
        old.created_at = now - ChronoDuration::hours(2);
        let ctx = ctx(
            expiring,
            vec![medium()],
            &["a", "b"],
            vec![pod("w1", 1, "a"), pod("w2", 1, "b")],
            vec![old, ready("b", 0.1)],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, now).plan();

        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].method, DisruptionMethod::Expiration);
        assert_eq!(plan.commands[0].nodes(), ["a"]);
        assert!(plan.commands[0].is_delete());
    }

    #[test]
    fn drift_that_would_strand_pods_is_rejected() {
        let now = Utc::now();
        let mut drifted = ready("a", 0.1);
        drifted.nodepool_hash = "stale".into();
        let ctx = ctx(
            pool(),
            Vec::new(),
            &["a"],
            vec![pod("w1", 1, "a")],
            vec![drifted],
        );
        let config = DisruptionConfig::default();
        let plan = Planner::new(&ctx, &config, now).plan();

        assert!(plan.commands.is_empty());
        assert_eq!(plan.rejected[0].method, DisruptionMethod::Drift);
        assert!(plan.rejected[0].reason.contains("would become unschedulable"));
    }

    #[test]
    fn disabled_methods_are_skipped() {
        let now = Utc::now();
        let ctx = ctx(
            pool(),
            vec![medium()],
            &["a"],
            Vec::new(),
            vec![empty_since(ready("a", 0.1), now - ChronoDuration::minutes(5))],
        );
        let config = DisruptionConfig {
            methods: vec![DisruptionMethod::Drift],
            ..DisruptionConfig::default()
        };
        assert!(Planner::new(&ctx, &config, now).plan().is_empty());
    }
}
