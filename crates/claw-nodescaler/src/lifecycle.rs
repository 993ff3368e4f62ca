//! NodeClaim lifecycle state machine and the arena that stores claims.
//!
//! A claim moves through
//! `Pending → Launched → Registered → Initialized → Ready → Disrupting →
//! Terminating → Terminated`, with `Failed` reachable from `Pending` and
//! `Launched`. Two extra edges exist: `Disrupting → Ready` rolls back an
//! aborted disruption, and an interruption may force `Disrupting` from any
//! launched phase.
//!
//! Claims are addressed by [`ClaimId`]. Nodes are found through the
//! provider-instance and node-name indexes rather than direct references.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use claw_provisioning::{
    DisruptionMethod, InstanceType, Node, NodeClaimTemplate, NodePool, Offering, PodKey,
    Requirements, Resources, Taint,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ControllerError, Result};

/// Stable identity of a NodeClaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimId(Uuid);

impl ClaimId {
    /// Creates a fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimPhase {
    /// Intent recorded, nothing launched yet.
    Pending,
    /// The provider created an instance.
    Launched,
    /// A node for the instance joined the cluster.
    Registered,
    /// The node's capacity and labels match the claim.
    Initialized,
    /// The node is schedulable.
    Ready,
    /// Selected for removal; being drained.
    Disrupting,
    /// Drained; instance deletion in progress.
    Terminating,
    /// Instance and node are gone.
    Terminated,
    /// Launch or registration failed.
    Failed,
}

impl ClaimPhase {
    /// Returns true if the lifecycle allows `self → to`. `forced` admits the
    /// interruption edges into `Disrupting`.
    #[must_use]
    pub const fn can_transition(self, to: Self, forced: bool) -> bool {
        use ClaimPhase::{
            Disrupting, Failed, Initialized, Launched, Pending, Ready, Registered, Terminated,
            Terminating,
        };
        match (self, to) {
            (Pending, Launched | Failed)
            | (Launched, Registered | Failed)
            | (Registered, Initialized)
            | (Initialized, Ready)
            | (Ready, Disrupting)
            | (Disrupting, Terminating | Ready)
            | (Terminating, Terminated) => true,
            (Launched | Registered | Initialized, Disrupting) => forced,
            _ => false,
        }
    }

    /// Returns true for `Terminated` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Returns true while the claim is on its way to becoming a usable node.
    #[must_use]
    pub const fn is_launching(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Launched | Self::Registered | Self::Initialized
        )
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Launched => "launched",
            Self::Registered => "registered",
            Self::Initialized => "initialized",
            Self::Ready => "ready",
            Self::Disrupting => "disrupting",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kinds of condition a claim reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Instance created.
    Launched,
    /// Node joined.
    Registered,
    /// Node matches the claim.
    Initialized,
    /// Node schedulable.
    Ready,
    /// Node no longer matches its NodePool.
    Drifted,
    /// Node holds no workload pods.
    Empty,
    /// Node selected for disruption.
    Disrupted,
}

/// A status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition kind.
    pub kind: ConditionKind,
    /// True or false.
    pub status: bool,
    /// Machine-readable reason.
    pub reason: String,
    /// When `status` last changed.
    pub last_transition: DateTime<Utc>,
}

/// The chosen offering, as recorded on the claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimOffering {
    /// Instance type name.
    pub instance_type: String,
    /// Zone.
    pub zone: String,
    /// Capacity type.
    pub capacity_type: claw_provisioning::CapacityType,
    /// Hourly price.
    pub price: f64,
}

impl From<&Offering> for ClaimOffering {
    fn from(o: &Offering) -> Self {
        Self {
            instance_type: o.instance_type.clone(),
            zone: o.zone.clone(),
            capacity_type: o.capacity_type,
            price: o.price,
        }
    }
}

/// A controller-owned request for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeClaim {
    /// Identity.
    pub id: ClaimId,
    /// Human-readable name, also used for the synthetic node while in flight.
    pub name: String,
    /// Owning NodePool.
    pub nodepool: String,
    /// Pool hash at launch time.
    pub nodepool_hash: String,
    /// Requirements the node satisfies.
    pub requirements: Requirements,
    /// Requests the claim was sized for, including daemonset overhead.
    pub requests: Resources,
    /// Daemonset overhead reserved on the node.
    pub daemon_overhead: Resources,
    /// Instance capacity.
    pub capacity: Resources,
    /// Instance allocatable capacity.
    pub allocatable: Resources,
    /// Chosen offering.
    pub offering: ClaimOffering,
    /// Template taints.
    pub taints: Vec<Taint>,
    /// Taints the node starts with and that must clear before initialization.
    pub startup_taints: Vec<Taint>,
    /// Kubelet pod limit override.
    pub max_pods: Option<u32>,
    /// Pods the claim was opened for.
    pub pods: Vec<PodKey>,
    /// Current phase.
    pub phase: ClaimPhase,
    /// Provider instance, once launched.
    pub provider_id: Option<String>,
    /// Node, once registered.
    pub node_name: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Launch time.
    pub launched_at: Option<DateTime<Utc>>,
    /// Deadline for the node to register.
    pub registration_deadline: Option<DateTime<Utc>>,
    /// Why the claim is being disrupted.
    pub disruption: Option<DisruptionMethod>,
    /// Status conditions.
    pub conditions: Vec<Condition>,
}

impl NodeClaim {
    /// Builds a pending claim from a simulator decision.
    #[must_use]
    pub fn from_template(template: &NodeClaimTemplate, pool: &NodePool, instance: &InstanceType) -> Self {
        let max_pods = pool.template.kubelet.max_pods;
        Self {
            id: ClaimId::new(),
            name: format!("{}-{}", pool.name, short_suffix()),
            nodepool: pool.name.clone(),
            nodepool_hash: pool.hash(),
            requirements: template.requirements.clone(),
            requests: template.requests,
            daemon_overhead: template.daemon_overhead,
            capacity: instance.capacity,
            allocatable: instance.allocatable(max_pods),
            offering: ClaimOffering::from(&template.offering),
            taints: pool.template.taints.clone(),
            startup_taints: pool.template.startup_taints.clone(),
            max_pods,
            pods: template.pods.clone(),
            phase: ClaimPhase::Pending,
            provider_id: None,
            node_name: None,
            created_at: Utc::now(),
            launched_at: None,
            registration_deadline: None,
            disruption: None,
            conditions: Vec::new(),
        }
    }

    /// Builds a `Ready` claim for a node that already runs, e.g. one that
    /// predates the controller.
    #[must_use]
    pub fn for_node(node: &Node, pool: &NodePool, offering: ClaimOffering) -> Self {
        let since = node.created_at;
        let mut claim = Self {
            id: ClaimId::new(),
            name: node.name.clone(),
            nodepool: pool.name.clone(),
            nodepool_hash: pool.hash(),
            requirements: node.requirements(),
            requests: Resources::new(),
            daemon_overhead: Resources::new(),
            capacity: node.capacity,
            allocatable: node.allocatable,
            offering,
            taints: node.taints.iter().filter(|t| !t.is_ephemeral()).cloned().collect(),
            startup_taints: Vec::new(),
            max_pods: pool.template.kubelet.max_pods,
            pods: Vec::new(),
            phase: ClaimPhase::Ready,
            provider_id: node.provider_id.clone(),
            node_name: Some(node.name.clone()),
            created_at: since,
            launched_at: Some(since),
            registration_deadline: None,
            disruption: None,
            conditions: Vec::new(),
        };
        for kind in [
            ConditionKind::Launched,
            ConditionKind::Registered,
            ConditionKind::Initialized,
            ConditionKind::Ready,
        ] {
            claim.set_condition(kind, true, "adopted", since);
        }
        claim
    }

    /// Looks up a condition.
    #[must_use]
    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Returns true if the condition is present and true.
    #[must_use]
    pub fn is_condition_true(&self, kind: ConditionKind) -> bool {
        self.condition(kind).is_some_and(|c| c.status)
    }

    /// Sets a condition. The transition time only moves when the status changes.
    pub fn set_condition(&mut self, kind: ConditionKind, status: bool, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(c) => {
                if c.status != status {
                    c.last_transition = now;
                }
                c.status = status;
                c.reason = reason;
            }
            None => self.conditions.push(Condition {
                kind,
                status,
                reason,
                last_transition: now,
            }),
        }
    }

    /// Removes a condition.
    pub fn clear_condition(&mut self, kind: ConditionKind) {
        self.conditions.retain(|c| c.kind != kind);
    }

    /// How long `kind` has been true, if it is.
    #[must_use]
    pub fn true_for(&self, kind: ConditionKind, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.condition(kind)
            .filter(|c| c.status)
            .map(|c| now - c.last_transition)
    }

    /// Hourly price of the chosen offering.
    #[must_use]
    pub const fn price(&self) -> f64 {
        self.offering.price
    }
}

fn short_suffix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[derive(Debug, Default)]
struct StoreInner {
    claims: BTreeMap<ClaimId, NodeClaim>,
    by_provider: HashMap<String, ClaimId>,
    by_node: HashMap<String, ClaimId>,
}

impl StoreInner {
    fn get_mut(&mut self, id: ClaimId) -> Result<&mut NodeClaim> {
        self.claims
            .get_mut(&id)
            .ok_or(ControllerError::ClaimNotFound { claim_id: id })
    }
}

/// Arena of claims with provider-instance and node-name indexes.
#[derive(Debug, Default)]
pub struct NodeClaimStore {
    inner: RwLock<StoreInner>,
}

impl NodeClaimStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a claim, indexing any provider ID and node it already carries.
    ///
    /// # Errors
    ///
    /// Returns error if another claim is bound to the same provider instance.
    pub fn insert(&self, claim: NodeClaim) -> Result<ClaimId> {
        let mut inner = self.inner.write();
        let id = claim.id;
        if let Some(pid) = &claim.provider_id {
            if let Some(existing) = inner.by_provider.get(pid) {
                return Err(ControllerError::DuplicateProviderId {
                    provider_id: pid.clone(),
                    existing: *existing,
                });
            }
            inner.by_provider.insert(pid.clone(), id);
        }
        if let Some(node) = &claim.node_name {
            inner.by_node.insert(node.clone(), id);
        }
        debug!(claim = %id, name = %claim.name, nodepool = %claim.nodepool, phase = %claim.phase, "claim stored");
        inner.claims.insert(id, claim);
        Ok(id)
    }

    /// A copy of the claim.
    #[must_use]
    pub fn get(&self, id: ClaimId) -> Option<NodeClaim> {
        self.inner.read().claims.get(&id).cloned()
    }

    /// Copies of every claim, in ID order.
    #[must_use]
    pub fn list(&self) -> Vec<NodeClaim> {
        self.inner.read().claims.values().cloned().collect()
    }

    /// Number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().claims.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The claim bound to a provider instance.
    #[must_use]
    pub fn by_provider_id(&self, provider_id: &str) -> Option<NodeClaim> {
        let inner = self.inner.read();
        inner
            .by_provider
            .get(provider_id)
            .and_then(|id| inner.claims.get(id))
            .cloned()
    }

    /// The claim bound to a node.
    #[must_use]
    pub fn by_node(&self, node: &str) -> Option<NodeClaim> {
        let inner = self.inner.read();
        inner
            .by_node
            .get(node)
            .and_then(|id| inner.claims.get(id))
            .cloned()
    }

    /// Moves a claim to `to`.
    ///
    /// # Errors
    ///
    /// Returns error if the claim does not exist or the edge is not allowed.
    pub fn transition(&self, id: ClaimId, to: ClaimPhase, forced: bool) -> Result<ClaimPhase> {
        let mut inner = self.inner.write();
        let claim = inner.get_mut(id)?;
        let from = claim.phase;
        if !from.can_transition(to, forced) {
            return Err(ControllerError::InvalidTransition {
                claim_id: id,
                from,
                to,
            });
        }
        claim.phase = to;
        info!(claim = %id, name = %claim.name, from = %from, to = %to, forced, "claim transitioned");
        Ok(from)
    }

    /// Binds the claim to a provider instance.
    ///
    /// # Errors
    ///
    /// Returns error if another claim already holds the instance.
    pub fn bind_provider(&self, id: ClaimId, provider_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_provider.get(provider_id) {
            if *existing == id {
                return Ok(());
            }
            return Err(ControllerError::DuplicateProviderId {
                provider_id: provider_id.to_string(),
                existing: *existing,
            });
        }
        let claim = inner.get_mut(id)?;
        claim.provider_id = Some(provider_id.to_string());
        inner.by_provider.insert(provider_id.to_string(), id);
        Ok(())
    }

    /// Binds the claim to the node that registered for it.
    ///
    /// # Errors
    ///
    /// Returns error if the claim does not exist.
    pub fn bind_node(&self, id: ClaimId, node: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.get_mut(id)?.node_name = Some(node.to_string());
        inner.by_node.insert(node.to_string(), id);
        Ok(())
    }

    /// Applies `f` to the claim.
    ///
    /// # Errors
    ///
    /// Returns error if the claim does not exist.
    pub fn update<F>(&self, id: ClaimId, f: F) -> Result<()>
    where
        F: FnOnce(&mut NodeClaim),
    {
        let mut inner = self.inner.write();
        f(inner.get_mut(id)?);
        Ok(())
    }

    /// Atomically moves every claim in `ids` to `Disrupting` for `method`, or
    /// none of them. A claim already disrupting makes the whole call fail,
    /// so overlapping disruptions can never both be applied.
    ///
    /// # Errors
    ///
    /// Returns the first claim that cannot enter `Disrupting`.
    pub fn begin_disrupting(
        &self,
        ids: &[ClaimId],
        method: DisruptionMethod,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let forced = !method.is_voluntary();
        let mut inner = self.inner.write();
        for id in ids {
            let claim = inner
                .claims
                .get(id)
                .ok_or(ControllerError::ClaimNotFound { claim_id: *id })?;
            if !claim.phase.can_transition(ClaimPhase::Disrupting, forced) {
                return Err(ControllerError::InvalidTransition {
                    claim_id: *id,
                    from: claim.phase,
                    to: ClaimPhase::Disrupting,
                });
            }
        }
        for id in ids {
            let claim = inner.get_mut(*id)?;
            claim.phase = ClaimPhase::Disrupting;
            claim.disruption = Some(method);
            claim.set_condition(ConditionKind::Disrupted, true, method.to_string(), now);
            info!(claim = %id, name = %claim.name, method = %method, "claim disrupting");
        }
        Ok(())
    }

    /// Returns claims from `Disrupting` to `Ready` after an aborted disruption
    /// and reports which ones were rolled back.
    ///
    /// # Errors
    ///
    /// Returns error if a claim is missing. Claims no longer disrupting are
    /// skipped, as are claims an interruption has taken over: those are
    /// terminated whatever happens to the voluntary command.
    pub fn abort_disrupting(
        &self,
        ids: &[ClaimId],
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimId>> {
        let mut inner = self.inner.write();
        let mut rolled_back = Vec::new();
        for id in ids {
            let claim = inner.get_mut(*id)?;
            if claim.phase != ClaimPhase::Disrupting
                || claim.disruption == Some(DisruptionMethod::Interruption)
            {
                continue;
            }
            claim.phase = ClaimPhase::Ready;
            claim.disruption = None;
            claim.set_condition(ConditionKind::Disrupted, false, reason, now);
            info!(claim = %id, name = %claim.name, reason, "disruption rolled back");
            rolled_back.push(*id);
        }
        Ok(rolled_back)
    }

    /// Drops terminal claims whose last update is older than `retention`.
    pub fn prune_terminal(&self, retention: ChronoDuration, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<ClaimId> = inner
            .claims
            .values()
            .filter(|c| c.phase.is_terminal())
            .filter(|c| {
                let last = c
                    .conditions
                    .iter()
                    .map(|cond| cond.last_transition)
                    .max()
                    .unwrap_or(c.created_at);
                now - last > retention
            })
            .map(|c| c.id)
            .collect();
        for id in &expired {
            if let Some(claim) = inner.claims.remove(id) {
                if let Some(pid) = claim.provider_id {
                    inner.by_provider.remove(&pid);
                }
                if let Some(node) = claim.node_name {
                    inner.by_node.remove(&node);
                }
            }
        }
        expired.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use claw_provisioning::CapacityType;

    /// A claim in `phase` with a fixed offering, for tests.
    pub fn claim(name: &str, pool: &str, phase: ClaimPhase) -> NodeClaim {
        NodeClaim {
            id: ClaimId::new(),
            name: name.to_string(),
            nodepool: pool.to_string(),
            nodepool_hash: String::new(),
            requirements: Requirements::new(),
            requests: Resources::new(),
            daemon_overhead: Resources::new(),
            capacity: Resources::new().with_cpu(4).with_pods(110),
            allocatable: Resources::new().with_cpu(4).with_pods(110),
            offering: ClaimOffering {
                instance_type: "medium".to_string(),
                zone: "zone-a".to_string(),
                capacity_type: CapacityType::OnDemand,
                price: 0.1,
            },
            taints: Vec::new(),
            startup_taints: Vec::new(),
            max_pods: None,
            pods: Vec::new(),
            phase,
            provider_id: None,
            node_name: None,
            created_at: Utc::now(),
            launched_at: None,
            registration_deadline: None,
            disruption: None,
            conditions: Vec::new(),
        }
    }
}
