//! Scheduling simulator.
//!
//! Places pending pods onto existing nodes and onto node claims opened during
//! the pass, using best-fit-decreasing over groups of pods that share a
//! scheduling signature. The simulation is a pure function of its inputs:
//! every collection it iterates is ordered and every choice has an explicit
//! tie-break, so identical inputs yield identical results.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::nodepool::NodePool;
use crate::offering::{CapacityPreference, InstanceType, Offering, OfferingCatalog};
use crate::pod::{Pod, PodKey};
use crate::predicates::{NodeView, Predicate};
use crate::requirements::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE, Requirement, Requirements};
use crate::resources::Resources;
use crate::snapshot::ClusterState;
use crate::taints::{Taint, untolerated};
use crate::topology::Topology;

/// Tunable simulator policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulingPolicy {
    /// How capacity types are weighed against price.
    pub capacity_preference: CapacityPreference,
}

/// Why a pod cannot be placed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum UnschedulableReason {
    /// No NodePool has any instance type to offer.
    NoOfferings,
    /// Requests exceed every compatible instance type.
    InsufficientCapacity,
    /// Constraints cannot be satisfied by any offering.
    ConstraintViolation(String),
    /// Capacity exists but every eligible pool is at its limit.
    NodePoolLimitsExceeded,
}

impl std::fmt::Display for UnschedulableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoOfferings => f.write_str("no offerings"),
            Self::InsufficientCapacity => f.write_str("insufficient capacity"),
            Self::ConstraintViolation(detail) => write!(f, "constraint violation: {detail}"),
            Self::NodePoolLimitsExceeded => f.write_str("nodepool limits exceeded"),
        }
    }
}

/// Where a pod was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlacementTarget {
    /// A node in the snapshot, by name.
    ExistingNode(String),
    /// A claim in [`SchedulingResults::node_claims`], by index.
    NewClaim(usize),
}

/// One pod's placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// The pod.
    pub pod: PodKey,
    /// Its target.
    pub target: PlacementTarget,
}

/// A node the simulator decided to launch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeClaimTemplate {
    /// Name used as the simulated host.
    pub name: String,
    /// Owning NodePool.
    pub nodepool: String,
    /// Requirements the launched node must satisfy, pinned to the chosen offering.
    pub requirements: Requirements,
    /// Instance types able to hold the claim, cheapest first.
    pub instance_types: Vec<String>,
    /// The chosen offering.
    pub offering: Offering,
    /// Requests of the assigned pods plus daemonset overhead.
    pub requests: Resources,
    /// Daemonset overhead reserved on the node.
    pub daemon_overhead: Resources,
    /// Taints from the pool template.
    pub taints: Vec<Taint>,
    /// Pods assigned to the claim.
    pub pods: Vec<PodKey>,
}

impl NodeClaimTemplate {
    /// Hourly price of the chosen offering.
    #[must_use]
    pub const fn price(&self) -> f64 {
        self.offering.price
    }
}

fn serialize_unschedulable<S: Serializer>(
    map: &BTreeMap<PodKey, UnschedulableReason>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_map(map.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

/// Output of one simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulingResults {
    /// Placements in processing order.
    pub placements: Vec<Placement>,
    /// Claims to launch.
    pub node_claims: Vec<NodeClaimTemplate>,
    /// Pods that could not be placed.
    #[serde(serialize_with = "serialize_unschedulable")]
    pub unschedulable: BTreeMap<PodKey, UnschedulableReason>,
}

impl SchedulingResults {
    /// Returns true if every pod was placed.
    #[must_use]
    pub fn all_scheduled(&self) -> bool {
        self.unschedulable.is_empty()
    }

    /// Hourly price of all new claims.
    #[must_use]
    pub fn new_capacity_price(&self) -> f64 {
        self.node_claims.iter().map(NodeClaimTemplate::price).sum()
    }

    /// Where `pod` was placed.
    #[must_use]
    pub fn target_of(&self, pod: &PodKey) -> Option<&PlacementTarget> {
        self.placements
            .iter()
            .find(|p| &p.pod == pod)
            .map(|p| &p.target)
    }

    /// Keys of the unschedulable pods.
    #[must_use]
    pub fn unschedulable_keys(&self) -> BTreeSet<&PodKey> {
        self.unschedulable.keys().collect()
    }
}

/// Simulates `pending` with the default policy.
#[must_use]
pub fn simulate(
    pending: &[Pod],
    state: &ClusterState,
    catalog: &OfferingCatalog,
    nodepools: &[NodePool],
) -> SchedulingResults {
    simulate_with(pending, state, catalog, nodepools, &SchedulingPolicy::default())
}

/// Simulates placing `pending` onto `state`, launching from `catalog` through
/// `nodepools` where needed.
#[must_use]
pub fn simulate_with(
    pending: &[Pod],
    state: &ClusterState,
    catalog: &OfferingCatalog,
    nodepools: &[NodePool],
    policy: &SchedulingPolicy,
) -> SchedulingResults {
    let unique: BTreeMap<PodKey, &Pod> = pending.iter().map(|p| (p.key(), p)).collect();

    // Largest first across every workload; a plan is shared per signature.
    let mut ordered: Vec<&Pod> = unique.into_values().collect();
    ordered.sort_by_key(|p| (Reverse(p.effective_requests().sort_key()), p.key()));

    let mut sim = Simulation::new(state, catalog, nodepools, *policy);
    let mut plans: HashMap<_, GroupPlan> = HashMap::new();
    for pod in ordered {
        let plan = plans
            .entry(pod.signature())
            .or_insert_with(|| sim.plan_group(pod));
        sim.place(pod, plan);
    }
    sim.finish()
}

struct PoolOption {
    pool: usize,
    alt: Requirements,
    types: Vec<usize>,
}

struct GroupPlan {
    options: Vec<PoolOption>,
    blocked: Option<UnschedulableReason>,
}

impl GroupPlan {
    fn option_for(&self, pool: usize) -> Option<&PoolOption> {
        self.options.iter().find(|o| o.pool == pool)
    }
}

struct OpenClaim {
    name: String,
    pool: usize,
    requirements: Requirements,
    candidates: Vec<usize>,
    requests: Resources,
    daemon_overhead: Resources,
    pods: Vec<PodKey>,
}

/// Requirements and requests a claim would carry with one more pod.
struct Draft {
    requirements: Requirements,
    requests: Resources,
}

/// A feasible way to put a pod on a claim, open or new.
struct ClaimFit {
    requirements: Requirements,
    candidates: Vec<usize>,
    requests: Resources,
    zone: Option<String>,
    leftover: (u64, u64, u32),
}

enum Rejection {
    Capacity,
    Limits,
    Constraint(String),
}

struct Simulation<'a> {
    state: &'a ClusterState,
    catalog: &'a OfferingCatalog,
    pools: Vec<&'a NodePool>,
    /// Per pool, per instance type: pool node requirements intersected with
    /// the type's own.
    bases: Vec<Vec<Requirements>>,
    daemon: Vec<Resources>,
    policy: SchedulingPolicy,
    topology: Topology,
    existing: Vec<NodeView>,
    claims: Vec<OpenClaim>,
    placements: Vec<Placement>,
    unschedulable: BTreeMap<PodKey, UnschedulableReason>,
}

impl<'a> Simulation<'a> {
    fn new(
        state: &'a ClusterState,
        catalog: &'a OfferingCatalog,
        nodepools: &'a [NodePool],
        policy: SchedulingPolicy,
    ) -> Self {
        let mut pools: Vec<&NodePool> = nodepools.iter().collect();
        pools.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

        let bases = pools
            .iter()
            .map(|p| {
                let node_reqs = p.node_requirements();
                catalog
                    .instance_types_for(&p.name)
                    .iter()
                    .map(|it| node_reqs.intersect(&it.requirements()))
                    .collect()
            })
            .collect();
        let daemon = pools.iter().map(|p| state.daemon_overhead(p)).collect();

        let catalog_zones: BTreeSet<String> = pools
            .iter()
            .flat_map(|p| catalog.instance_types_for(&p.name))
            .flat_map(InstanceType::available_offerings)
            .map(|o| o.zone.clone())
            .collect();

        Self {
            state,
            catalog,
            pools,
            bases,
            daemon,
            policy,
            topology: Topology::from_state(state, catalog_zones),
            existing: state
                .nodes()
                .filter(|sn| sn.node.accepts_pods())
                .map(NodeView::from_state)
                .collect(),
            claims: Vec::new(),
            placements: Vec::new(),
            unschedulable: BTreeMap::new(),
        }
    }

    fn types(&self, pool: usize) -> &'a [InstanceType] {
        self.catalog.instance_types_for(&self.pools[pool].name)
    }

    fn max_pods(&self, pool: usize) -> Option<u32> {
        self.pools[pool].template.kubelet.max_pods
    }

    /// Pool and instance-type compatibility for one signature group. Only
    /// labels and taints matter here, so it is shared by the whole group.
    fn plan_group(&self, pod: &Pod) -> GroupPlan {
        if (0..self.pools.len()).all(|p| self.types(p).is_empty()) {
            return GroupPlan {
                options: Vec::new(),
                blocked: Some(UnschedulableReason::NoOfferings),
            };
        }

        let alternatives = pod.scheduling_requirements();
        let mut options = Vec::new();
        let mut first_conflict: Option<String> = None;
        for (pi, pool) in self.pools.iter().enumerate() {
            if self.types(pi).is_empty() {
                continue;
            }
            if let Some(t) = untolerated(&pool.template.taints, &pod.tolerations) {
                first_conflict.get_or_insert_with(|| format!("nodepool {}: untolerated taint {t}", pool.name));
                continue;
            }
            for alt in &alternatives {
                let types: Vec<usize> = (0..self.types(pi).len())
                    .filter(|&ti| self.type_admits(pi, ti, alt))
                    .collect();
                if types.is_empty() {
                    if first_conflict.is_none() {
                        first_conflict = Some(self.describe_conflict(pi, alt));
                    }
                    continue;
                }
                options.push(PoolOption {
                    pool: pi,
                    alt: alt.clone(),
                    types,
                });
                break;
            }
        }

        let blocked = options.is_empty().then(|| {
            UnschedulableReason::ConstraintViolation(
                first_conflict.unwrap_or_else(|| "no compatible nodepool".to_string()),
            )
        });
        GroupPlan { options, blocked }
    }

    fn describe_conflict(&self, pool: usize, alt: &Requirements) -> String {
        let name = &self.pools[pool].name;
        match self.bases[pool].iter().find_map(|base| base.conflict(alt)) {
            Some(c) => format!("nodepool {name}: {c}"),
            None => format!("nodepool {name}: no offering matches zone and capacity type"),
        }
    }

    fn type_admits(&self, pool: usize, ti: usize, reqs: &Requirements) -> bool {
        let base = &self.bases[pool][ti];
        base.conflict(reqs).is_none()
            && self.types(pool)[ti]
                .compatible_offerings(&base.intersect(reqs))
                .next()
                .is_some()
    }

    fn place(&mut self, pod: &Pod, plan: &GroupPlan) {
        let key = pod.key();
        if let Some(i) = self.best_existing(pod) {
            let view = &mut self.existing[i];
            view.available = view.available.saturating_sub(&pod.effective_requests());
            let zone = view.zones.first().cloned();
            let name = view.name.clone();
            self.topology.record(pod, &name, zone.as_deref());
            debug!(pod = %key, node = %name, "placed on existing node");
            self.placements.push(Placement {
                pod: key,
                target: PlacementTarget::ExistingNode(name),
            });
            return;
        }

        if let Some(reason) = &plan.blocked {
            debug!(pod = %key, %reason, "unschedulable");
            self.unschedulable.insert(key, reason.clone());
            return;
        }

        let best = (0..self.claims.len())
            .filter_map(|c| {
                let option = plan.option_for(self.claims[c].pool)?;
                self.fit_open_claim(c, pod, option).ok().map(|fit| (c, fit))
            })
            .min_by(|(a, fa), (b, fb)| fa.leftover.cmp(&fb.leftover).then(a.cmp(b)));
        if let Some((c, fit)) = best {
            self.commit(c, pod, fit);
            debug!(pod = %key, claim = %self.claims[c].name, "placed on open claim");
            self.placements.push(Placement {
                pod: key,
                target: PlacementTarget::NewClaim(c),
            });
            return;
        }

        match self.open_claim(pod, plan) {
            Ok(c) => {
                debug!(pod = %key, claim = %self.claims[c].name, "opened claim");
                self.placements.push(Placement {
                    pod: key,
                    target: PlacementTarget::NewClaim(c),
                });
            }
            Err(reason) => {
                debug!(pod = %key, %reason, "unschedulable");
                self.unschedulable.insert(key, reason);
            }
        }
    }

    fn best_existing(&self, pod: &Pod) -> Option<usize> {
        let requests = pod.effective_requests();
        let mut best: Option<(usize, (u64, u64, u32))> = None;
        for (i, view) in self.existing.iter().enumerate() {
            if Predicate::first_failure(pod, view, &self.topology).is_some() {
                continue;
            }
            let left = view.available.saturating_sub(&requests).sort_key();
            if best.is_none_or(|(_, b)| left < b) {
                best = Some((i, left));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Room left under the pool's limits, ignoring claim `skip`. Limit
    /// components set to zero are unconstrained.
    fn limit_room(&self, pool: usize, skip: Option<usize>) -> Option<(Resources, Resources)> {
        let limits = self.pools[pool].limits?;
        let mut used = self.state.nodepool_usage(&self.pools[pool].name);
        for (c, claim) in self.claims.iter().enumerate() {
            if claim.pool != pool || Some(c) == skip {
                continue;
            }
            if let Some(smallest) = claim
                .candidates
                .iter()
                .map(|&ti| self.types(pool)[ti].capacity)
                .min_by_key(Resources::sort_key)
            {
                used = used.add(&smallest);
            }
        }
        Some((limits, limits.saturating_sub(&used)))
    }

    fn within_limits(capacity: &Resources, room: Option<&(Resources, Resources)>) -> bool {
        let Some((limits, left)) = room else { return true };
        (limits.cpu_millis == 0 || capacity.cpu_millis <= left.cpu_millis)
            && (limits.memory_bytes == 0 || capacity.memory_bytes <= left.memory_bytes)
            && (limits.gpus == 0 || capacity.gpus <= left.gpus)
            && (limits.pods == 0 || capacity.pods <= left.pods)
    }

    /// Narrows `candidates` to the types that hold `requests` within limits
    /// and satisfy `reqs`, then applies topology to pick zones.
    fn fit(
        &self,
        pool: usize,
        host: &str,
        pod: &Pod,
        candidates: impl Iterator<Item = usize>,
        draft: Draft,
        skip: Option<usize>,
    ) -> Result<ClaimFit, Rejection> {
        let Draft {
            requirements: mut reqs,
            requests,
        } = draft;
        let max_pods = self.max_pods(pool);
        let types = self.types(pool);
        let room = self.limit_room(pool, skip);

        let fitting: Vec<usize> = candidates
            .filter(|&ti| requests.fits_in(&types[ti].allocatable(max_pods)))
            .collect();
        if fitting.is_empty() {
            return Err(Rejection::Capacity);
        }
        let mut kept: Vec<usize> = fitting
            .into_iter()
            .filter(|&ti| Self::within_limits(&types[ti].capacity, room.as_ref()))
            .filter(|&ti| self.type_admits(pool, ti, &reqs))
            .collect();
        if kept.is_empty() {
            return Err(Rejection::Limits);
        }

        let zones: BTreeSet<String> = kept
            .iter()
            .flat_map(|&ti| {
                let narrowed = self.bases[pool][ti].intersect(&reqs);
                types[ti]
                    .compatible_offerings(&narrowed)
                    .map(|o| o.zone.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        let allowed = self
            .topology
            .allowed_zones(pod, host, &zones)
            .map_err(Rejection::Constraint)?;
        let restricted: BTreeSet<String> = if Topology::has_zone_constraints(pod) {
            allowed.iter().next().cloned().into_iter().collect()
        } else {
            allowed
        };
        if restricted != zones {
            reqs.add(Requirement::in_values(LABEL_ZONE, restricted.iter().cloned()));
            kept.retain(|&ti| self.type_admits(pool, ti, &reqs));
            if kept.is_empty() {
                return Err(Rejection::Constraint("no offering in an allowed zone".to_string()));
            }
        }

        let leftover = kept
            .iter()
            .map(|&ti| types[ti].allocatable(max_pods).saturating_sub(&requests).sort_key())
            .min()
            .unwrap_or_default();
        let zone = (restricted.len() == 1)
            .then(|| restricted.into_iter().next())
            .flatten();
        Ok(ClaimFit {
            requirements: reqs,
            candidates: kept,
            requests,
            zone,
            leftover,
        })
    }

    fn fit_open_claim(&self, c: usize, pod: &Pod, option: &PoolOption) -> Result<ClaimFit, Rejection> {
        let claim = &self.claims[c];
        if untolerated(&self.pools[claim.pool].template.taints, &pod.tolerations).is_some() {
            return Err(Rejection::Constraint("untolerated taint".to_string()));
        }
        let candidates = claim
            .candidates
            .iter()
            .copied()
            .filter(|ti| option.types.contains(ti));
        self.fit(
            claim.pool,
            &claim.name,
            pod,
            candidates,
            Draft {
                requirements: claim.requirements.intersect(&option.alt),
                requests: claim.requests.add(&pod.effective_requests()),
            },
            Some(c),
        )
    }

    fn commit(&mut self, c: usize, pod: &Pod, fit: ClaimFit) {
        let claim = &mut self.claims[c];
        claim.requirements = fit.requirements;
        claim.candidates = fit.candidates;
        claim.requests = fit.requests;
        claim.pods.push(pod.key());
        let name = claim.name.clone();
        self.topology.record(pod, &name, fit.zone.as_deref());
        if let Some(zone) = &fit.zone {
            self.topology.set_host_zone(&name, zone);
        }
    }

    fn open_claim(&mut self, pod: &Pod, plan: &GroupPlan) -> Result<usize, UnschedulableReason> {
        let name = format!("simulated-{}", self.claims.len());
        let mut best: Option<(usize, ClaimFit, (u8, f64))> = None;
        let mut limited = false;
        let mut constraint: Option<String> = None;

        for option in &plan.options {
            let pool = option.pool;
            let draft = Draft {
                requirements: self.pools[pool].node_requirements().intersect(&option.alt),
                requests: self.daemon[pool].add(&pod.effective_requests()),
            };
            match self.fit(pool, &name, pod, option.types.iter().copied(), draft, None) {
                Ok(fit) => {
                    let Some(cost) = self.cheapest(pool, &fit) else { continue };
                    // Cheaper, then heavier pool, then more headroom.
                    let better = best.as_ref().is_none_or(|(bp, bf, bc)| {
                        cost.0
                            .cmp(&bc.0)
                            .then(cost.1.total_cmp(&bc.1))
                            .then(self.pools[*bp].weight.cmp(&self.pools[pool].weight))
                            .then(bf.leftover.cmp(&fit.leftover))
                            == Ordering::Less
                    });
                    if better {
                        best = Some((pool, fit, cost));
                    }
                }
                Err(Rejection::Capacity) => {}
                Err(Rejection::Limits) => limited = true,
                Err(Rejection::Constraint(c)) => {
                    constraint.get_or_insert(c);
                }
            }
        }

        let Some((pool, fit, _)) = best else {
            return Err(match (constraint, limited) {
                (Some(c), _) => UnschedulableReason::ConstraintViolation(c),
                (None, true) => UnschedulableReason::NodePoolLimitsExceeded,
                (None, false) => UnschedulableReason::InsufficientCapacity,
            });
        };

        let c = self.claims.len();
        self.claims.push(OpenClaim {
            name,
            pool,
            requirements: Requirements::new(),
            candidates: Vec::new(),
            requests: Resources::new(),
            daemon_overhead: self.daemon[pool],
            pods: Vec::new(),
        });
        self.commit(c, pod, fit);
        Ok(c)
    }

    /// Preference rank and price of the cheapest offering a fit allows.
    fn cheapest(&self, pool: usize, fit: &ClaimFit) -> Option<(u8, f64)> {
        let pref = self.policy.capacity_preference;
        fit.candidates
            .iter()
            .filter_map(|&ti| {
                let reqs = self.bases[pool][ti].intersect(&fit.requirements);
                self.types(pool)[ti].best_offering(&reqs, pref)
            })
            .map(|o| (pref.rank(o.capacity_type), o.price))
            .min_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)))
    }

    fn finalize(&self, claim: &OpenClaim) -> Option<NodeClaimTemplate> {
        let pool = claim.pool;
        let pref = self.policy.capacity_preference;
        let types = self.types(pool);
        let max_pods = self.max_pods(pool);

        let mut options: Vec<(usize, &Offering, (u64, u64, u32))> = Vec::new();
        for &ti in &claim.candidates {
            let it = &types[ti];
            let reqs = self.bases[pool][ti].intersect(&claim.requirements);
            let headroom = it.allocatable(max_pods).saturating_sub(&claim.requests).sort_key();
            if let Some(o) = it.best_offering(&reqs, pref) {
                options.push((ti, o, headroom));
            }
        }
        options.sort_by(|(_, a, ha), (_, b, hb)| {
            pref.rank(a.capacity_type)
                .cmp(&pref.rank(b.capacity_type))
                .then(a.price.total_cmp(&b.price))
                .then(hb.cmp(ha))
                .then_with(|| a.cmp_for(b, pref))
        });
        let &(ti, offering, _) = options.first()?;

        let mut requirements = self.bases[pool][ti].intersect(&claim.requirements);
        requirements.add(Requirement::in_values(LABEL_INSTANCE_TYPE, [types[ti].name.clone()]));
        requirements.add(Requirement::in_values(LABEL_ZONE, [offering.zone.clone()]));
        requirements.add(Requirement::in_values(
            LABEL_CAPACITY_TYPE,
            [offering.capacity_type.as_str()],
        ));

        Some(NodeClaimTemplate {
            name: claim.name.clone(),
            nodepool: self.pools[pool].name.clone(),
            requirements,
            instance_types: options.iter().map(|(ti, _, _)| types[*ti].name.clone()).collect(),
            offering: offering.clone(),
            requests: claim.requests,
            daemon_overhead: claim.daemon_overhead,
            taints: self.pools[pool].template.taints.clone(),
            pods: claim.pods.clone(),
        })
    }

    fn finish(mut self) -> SchedulingResults {
        let mut remap = Vec::with_capacity(self.claims.len());
        let mut node_claims = Vec::new();
        for claim in &self.claims {
            match self.finalize(claim) {
                Some(mut template) => {
                    remap.push(Some(node_claims.len()));
                    template.name = format!("{}-{}", template.nodepool, node_claims.len());
                    node_claims.push(template);
                }
                None => remap.push(None),
            }
        }

        let mut placements = Vec::with_capacity(self.placements.len());
        for p in std::mem::take(&mut self.placements) {
            match p.target {
                PlacementTarget::NewClaim(c) => match remap.get(c).copied().flatten() {
                    Some(n) => placements.push(Placement {
                        pod: p.pod,
                        target: PlacementTarget::NewClaim(n),
                    }),
                    None => {
                        self.unschedulable
                            .insert(p.pod, UnschedulableReason::InsufficientCapacity);
                    }
                },
                PlacementTarget::ExistingNode(_) => placements.push(p),
            }
        }

        SchedulingResults {
            placements,
            node_claims,
            unschedulable: self.unschedulable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::offering::CapacityType;
    use crate::pod::{LabelSelector, PodAffinityTerm, TopologySpreadConstraint};
    use crate::requirements::{LABEL_ARCH, LABEL_HOSTNAME, LABEL_NODEPOOL};
    use crate::taints::{TaintEffect, Toleration};
    use proptest::prelude::*;

    fn pool() -> NodePool {
        NodePool::new("default")
    }

    fn small() -> InstanceType {
        InstanceType::new("small", Resources::new().with_cpu(2).with_memory_gib(4))
            .with_offering("zone-a", CapacityType::OnDemand, 0.05)
    }

    fn large() -> InstanceType {
        InstanceType::new("large", Resources::new().with_cpu(8).with_memory_gib(16))
            .with_offering("zone-a", CapacityType::OnDemand, 0.15)
    }

    fn catalog(types: Vec<InstanceType>) -> OfferingCatalog {
        OfferingCatalog::new().with_pool(&pool(), types)
    }

    fn cpu_pod(name: &str, cores: u64) -> Pod {
        Pod::new("default", name).with_requests(Resources::new().with_cpu(cores))
    }

    fn run(pods: &[Pod], state: &ClusterState, types: Vec<InstanceType>) -> SchedulingResults {
        simulate(pods, state, &catalog(types), &[pool()])
    }

    mod packing_tests {
        use super::*;

        #[test]
        fn three_cpu_pods_need_two_large_nodes() {
            let pods: Vec<Pod> = (0..3).map(|i| cpu_pod(&format!("p{i}"), 3)).collect();
            let results = run(&pods, &ClusterState::default(), vec![small(), large()]);
            assert!(results.all_scheduled());
            assert_eq!(results.node_claims.len(), 2);
            for claim in &results.node_claims {
                assert_eq!(claim.offering.instance_type, "large");
            }
        }

        #[test]
        fn workloads_are_packed_largest_first_together() {
            let pods: Vec<Pod> = [(4, "a"), (4, "a"), (2, "a"), (3, "a"), (3, "b"), (7, "b")]
                .iter()
                .enumerate()
                .map(|(i, (cores, app))| cpu_pod(&format!("p{i}"), *cores).with_label("app", *app))
                .collect();
            let results = run(&pods, &ClusterState::default(), vec![large()]);
            assert!(results.all_scheduled());
            assert_eq!(results.node_claims.len(), 3);
            assert_eq!(
                results.placements.first().map(|p| p.pod.name.as_str()),
                Some("p5")
            );
        }

        #[test]
        fn small_pods_grow_a_claim_before_opening_another() {
            let pods: Vec<Pod> = (0..5).map(|i| cpu_pod(&format!("p{i}"), 1)).collect();
            let results = run(&pods, &ClusterState::default(), vec![small(), large()]);
            assert_eq!(results.node_claims.len(), 1);
            assert_eq!(results.node_claims[0].offering.instance_type, "large");
            assert_eq!(results.node_claims[0].pods.len(), 5);
        }

        #[test]
        fn single_small_pod_gets_cheapest_type() {
            let results = run(&[cpu_pod("p", 1)], &ClusterState::default(), vec![small(), large()]);
            assert_eq!(results.node_claims[0].offering.instance_type, "small");
            assert_eq!(results.node_claims[0].instance_types, vec!["small", "large"]);
        }

        #[test]
        fn existing_capacity_is_used_first() {
            let node = Node::new("n1")
                .with_label(LABEL_NODEPOOL, "default")
                .with_allocatable(Resources::new().with_cpu(4).with_memory_gib(8));
            let state = ClusterState::snapshot(vec![node], vec![], vec![]);
            let results = run(&[cpu_pod("p", 2)], &state, vec![small()]);
            assert!(results.node_claims.is_empty());
            assert_eq!(
                results.target_of(&PodKey::new("default", "p")),
                Some(&PlacementTarget::ExistingNode("n1".to_string()))
            );
        }

        #[test]
        fn best_fit_prefers_tightest_node() {
            let roomy = Node::new("roomy").with_allocatable(Resources::new().with_cpu(8));
            let snug = Node::new("snug").with_allocatable(Resources::new().with_cpu(2));
            let state = ClusterState::snapshot(vec![roomy, snug], vec![], vec![]);
            let results = run(&[cpu_pod("p", 2)], &state, vec![]);
            assert_eq!(
                results.target_of(&PodKey::new("default", "p")),
                Some(&PlacementTarget::ExistingNode("snug".to_string()))
            );
        }

        #[test]
        fn daemon_overhead_is_reserved_on_new_claims() {
            let ds = cpu_pod("agent", 1).with_owner("DaemonSet", "agent");
            let state = ClusterState::snapshot(vec![], vec![], vec![ds]);
            let results = run(&[cpu_pod("p", 2)], &state, vec![small(), large()]);
            let claim = &results.node_claims[0];
            assert_eq!(claim.offering.instance_type, "large");
            assert_eq!(claim.daemon_overhead.cpu_millis, 1000);
            assert_eq!(claim.requests.cpu_millis, 3000);
        }
    }

    mod failure_tests {
        use super::*;

        #[test]
        fn empty_catalog_reports_no_offerings() {
            let results = run(&[cpu_pod("p", 1)], &ClusterState::default(), vec![]);
            assert_eq!(
                results.unschedulable.get(&PodKey::new("default", "p")),
                Some(&UnschedulableReason::NoOfferings)
            );
        }

        #[test]
        fn oversized_pod_reports_insufficient_capacity() {
            let results = run(&[cpu_pod("p", 64)], &ClusterState::default(), vec![small(), large()]);
            assert_eq!(
                results.unschedulable.get(&PodKey::new("default", "p")),
                Some(&UnschedulableReason::InsufficientCapacity)
            );
        }

        #[test]
        fn contradictory_selector_reports_constraint_violation() {
            let pod = cpu_pod("p", 1).with_node_selector(LABEL_ARCH, "arm64");
            let types = vec![small().with_label(LABEL_ARCH, "amd64")];
            let results = run(&[pod], &ClusterState::default(), types);
            let reason = results.unschedulable.get(&PodKey::new("default", "p"));
            assert!(matches!(reason, Some(UnschedulableReason::ConstraintViolation(_))));
            assert!(reason.is_some_and(|r| r.to_string().starts_with("constraint violation: ")));
        }

        #[test]
        fn untolerated_pool_taint_is_a_constraint_violation() {
            let tainted = pool().with_taint(Taint::new("gpu", TaintEffect::NoSchedule));
            let catalog = OfferingCatalog::new().with_pool(&tainted, vec![small()]);
            let results = simulate(&[cpu_pod("p", 1)], &ClusterState::default(), &catalog, &[tainted.clone()]);
            assert!(matches!(
                results.unschedulable.values().next(),
                Some(UnschedulableReason::ConstraintViolation(_))
            ));

            let tolerant = cpu_pod("q", 1).with_toleration(Toleration::exists("gpu"));
            let results = simulate(&[tolerant], &ClusterState::default(), &catalog, &[tainted]);
            assert!(results.all_scheduled());
            assert_eq!(results.node_claims[0].taints.len(), 1);
        }

        #[test]
        fn limits_block_new_capacity() {
            let limited = pool().with_limits(Resources::new().with_cpu(8));
            let catalog = OfferingCatalog::new().with_pool(&limited, vec![large()]);
            let pods: Vec<Pod> = (0..2).map(|i| cpu_pod(&format!("p{i}"), 6)).collect();
            let results = simulate(&pods, &ClusterState::default(), &catalog, &[limited]);
            assert_eq!(results.node_claims.len(), 1);
            assert_eq!(
                results.unschedulable.values().next(),
                Some(&UnschedulableReason::NodePoolLimitsExceeded)
            );
        }
    }

    mod constraint_tests {
        use super::*;

        fn zonal() -> InstanceType {
            InstanceType::new("zonal", Resources::new().with_cpu(4))
                .with_offering("zone-a", CapacityType::OnDemand, 0.10)
                .with_offering("zone-b", CapacityType::OnDemand, 0.10)
                .with_offering("zone-c", CapacityType::OnDemand, 0.10)
        }

        #[test]
        fn hostname_anti_affinity_spreads_pods_across_claims() {
            let pods: Vec<Pod> = (0..3)
                .map(|i| {
                    cpu_pod(&format!("w{i}"), 1)
                        .with_label("app", "web")
                        .with_pod_anti_affinity(PodAffinityTerm::new(
                            LabelSelector::label("app", "web"),
                            LABEL_HOSTNAME,
                        ))
                })
                .collect();
            let results = run(&pods, &ClusterState::default(), vec![large()]);
            assert!(results.all_scheduled());
            assert_eq!(results.node_claims.len(), 3);
        }

        #[test]
        fn zone_spread_pins_each_claim_to_a_distinct_zone() {
            let pods: Vec<Pod> = (0..3)
                .map(|i| {
                    cpu_pod(&format!("w{i}"), 3)
                        .with_label("app", "web")
                        .with_topology_spread(TopologySpreadConstraint::new(
                            1,
                            LABEL_ZONE,
                            LabelSelector::label("app", "web"),
                        ))
                })
                .collect();
            let results = run(&pods, &ClusterState::default(), vec![zonal()]);
            assert!(results.all_scheduled());
            let zones: BTreeSet<&str> = results
                .node_claims
                .iter()
                .map(|c| c.offering.zone.as_str())
                .collect();
            assert_eq!(zones.len(), 3);
        }

        #[test]
        fn node_selector_zone_is_honoured() {
            let pod = cpu_pod("p", 1).with_node_selector(LABEL_ZONE, "zone-b");
            let results = run(&[pod], &ClusterState::default(), vec![zonal()]);
            assert_eq!(results.node_claims[0].offering.zone, "zone-b");
        }

        #[test]
        fn spot_preference_changes_choice() {
            let mixed = InstanceType::new("mixed", Resources::new().with_cpu(4))
                .with_offering("zone-a", CapacityType::OnDemand, 0.10)
                .with_offering("zone-a", CapacityType::Spot, 0.04);
            let catalog = catalog(vec![mixed]);
            let cheapest = simulate(&[cpu_pod("p", 1)], &ClusterState::default(), &catalog, &[pool()]);
            assert_eq!(cheapest.node_claims[0].offering.capacity_type, CapacityType::Spot);

            let policy = SchedulingPolicy {
                capacity_preference: CapacityPreference::PreferOnDemand,
            };
            let od = simulate_with(&[cpu_pod("p", 1)], &ClusterState::default(), &catalog, &[pool()], &policy);
            assert_eq!(od.node_claims[0].offering.capacity_type, CapacityType::OnDemand);
        }

        #[test]
        fn heavier_pool_wins_price_ties() {
            let a = NodePool::new("a");
            let b = NodePool::new("b").with_weight(10);
            let catalog = OfferingCatalog::new()
                .with_pool(&a, vec![small()])
                .with_pool(&b, vec![small()]);
            let results = simulate(&[cpu_pod("p", 1)], &ClusterState::default(), &catalog, &[a, b]);
            assert_eq!(results.node_claims[0].nodepool, "b");
        }
    }

    /// First-fit in input order on a single instance type.
    fn first_fit_bins(sizes: &[u64], bin: u64) -> usize {
        let mut bins: Vec<u64> = Vec::new();
        for &s in sizes {
            match bins.iter_mut().find(|used| **used + s <= bin) {
                Some(used) => *used += s,
                None => bins.push(s),
            }
        }
        bins.len()
    }

    mod proptest_tests {
        use super::*;

        fn sizes() -> impl Strategy<Value = Vec<u64>> {
            prop::collection::vec(prop::sample::select(vec![1_u64, 2, 4, 8]), 1..40)
        }

        proptest! {
            #[test]
            fn simulation_is_deterministic(sizes in sizes()) {
                let pods: Vec<Pod> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, s)| cpu_pod(&format!("p{i:02}"), *s))
                    .collect();
                let a = run(&pods, &ClusterState::default(), vec![small(), large()]);
                let b = run(&pods, &ClusterState::default(), vec![small(), large()]);
                prop_assert_eq!(a, b);
            }

            #[test]
            fn never_more_nodes_than_first_fit(
                sizes in sizes(),
                apps in prop::collection::vec(0_usize..3, 40),
            ) {
                let pods: Vec<Pod> = sizes
                    .iter()
                    .zip(&apps)
                    .enumerate()
                    .map(|(i, (s, app))| {
                        cpu_pod(&format!("p{i:02}"), *s).with_label("app", format!("app-{app}"))
                    })
                    .collect();
                let results = run(&pods, &ClusterState::default(), vec![large()]);
                prop_assert!(results.all_scheduled());
                prop_assert!(results.node_claims.len() <= first_fit_bins(&sizes, 8));
            }

            #[test]
            fn placements_respect_capacity(sizes in sizes()) {
                let pods: Vec<Pod> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, s)| cpu_pod(&format!("p{i:02}"), *s))
                    .collect();
                let results = run(&pods, &ClusterState::default(), vec![small(), large()]);
                for claim in &results.node_claims {
                    let cpu: u64 = claim
                        .pods
                        .iter()
                        .filter_map(|k| pods.iter().find(|p| &p.key() == k))
                        .map(|p| p.requests.cpu_millis)
                        .sum();
                    let capacity = if claim.offering.instance_type == "large" { 8000 } else { 2000 };
                    prop_assert!(cpu <= capacity);
                }
            }
        }
    }
}
