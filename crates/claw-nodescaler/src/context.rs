//! Per-pass reconciliation context.
//!
//! Everything a pass decides on is captured once, up front, and shared
//! immutably: the cluster snapshot, the offering catalog, NodePools,
//! disruption budgets and the claims. The next pass captures a fresh one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use claw_provisioning::requirements::LABEL_NODEPOOL;
use claw_provisioning::{
    ClusterState, Node, NodePool, OfferingCatalog, Requirements, Resources, SchedulingPolicy,
    Taint,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backoff::Backoff;
use crate::cluster::{ClusterClient, PodDisruptionBudget};
use crate::error::Result;
use crate::lifecycle::{ClaimPhase, NodeClaim, NodeClaimStore};
use crate::provider::CloudProvider;

/// Immutable inputs of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// Nodes (including in-flight claims), pods and daemonsets.
    pub state: Arc<ClusterState>,
    /// Offerings per NodePool.
    pub catalog: Arc<OfferingCatalog>,
    /// NodePools.
    pub nodepools: Arc<[NodePool]>,
    /// Pod disruption budgets.
    pub pdbs: Arc<[PodDisruptionBudget]>,
    /// Claims as of capture time.
    pub claims: Arc<[NodeClaim]>,
    /// Simulator policy.
    pub policy: SchedulingPolicy,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

impl ReconcileContext {
    /// Assembles a context from already-fetched parts.
    #[must_use]
    pub fn new(state: ClusterState, catalog: OfferingCatalog, nodepools: Vec<NodePool>) -> Self {
        Self {
            state: Arc::new(state),
            catalog: Arc::new(catalog),
            nodepools: nodepools.into(),
            pdbs: Arc::new([]),
            claims: Arc::new([]),
            policy: SchedulingPolicy::default(),
            captured_at: Utc::now(),
        }
    }

    /// Sets the disruption budgets.
    #[must_use]
    pub fn with_pdbs(mut self, pdbs: Vec<PodDisruptionBudget>) -> Self {
        self.pdbs = pdbs.into();
        self
    }

    /// Sets the claims.
    #[must_use]
    pub fn with_claims(mut self, claims: Vec<NodeClaim>) -> Self {
        self.claims = claims.into();
        self
    }

    /// Sets the simulator policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the capture time.
    #[must_use]
    pub const fn at(mut self, now: DateTime<Utc>) -> Self {
        self.captured_at = now;
        self
    }

    /// Captures a context from the collaborators. Claims that have not yet
    /// produced a node are added to the snapshot as in-flight nodes so pods
    /// already provisioned for are not provisioned for twice.
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator call fails after retries.
    pub async fn capture<P, C>(
        provider: &P,
        cluster: &C,
        store: &NodeClaimStore,
        backoff: &Backoff,
        policy: SchedulingPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        P: CloudProvider,
        C: ClusterClient,
    {
        let nodes = backoff.retry("list nodes", cancel, || cluster.list_nodes()).await?;
        let pods = backoff.retry("list pods", cancel, || cluster.list_pods()).await?;
        let daemonsets = backoff
            .retry("list daemonsets", cancel, || cluster.list_daemonsets())
            .await?;
        let nodepools = backoff
            .retry("list nodepools", cancel, || cluster.list_nodepools())
            .await?;
        let pdbs = backoff.retry("list pdbs", cancel, || cluster.list_pdbs()).await?;

        let mut catalog = OfferingCatalog::new();
        for pool in &nodepools {
            if let Err(e) = pool.validate() {
                debug!(nodepool = %pool.name, error = %e, "skipping invalid nodepool");
                continue;
            }
            let types = backoff
                .retry("list offerings", cancel, || async move {
                    provider.list_offerings(pool).await.map_err(Into::into)
                })
                .await?;
            catalog.insert(pool, types);
        }

        let claims = store.list();
        let mut state = ClusterState::snapshot(nodes.clone(), pods, daemonsets);
        for claim in &claims {
            if let Some(node) = in_flight_node(claim, &nodes) {
                state = state.with_in_flight(node);
            }
        }

        debug!(
            nodes = nodes.len(),
            nodepools = nodepools.len(),
            claims = claims.len(),
            "context captured"
        );

        Ok(Self {
            state: Arc::new(state),
            catalog: Arc::new(catalog),
            nodepools: nodepools.into(),
            pdbs: pdbs.into(),
            claims: claims.into(),
            policy,
            captured_at: Utc::now(),
        })
    }

    /// Looks up a NodePool.
    #[must_use]
    pub fn nodepool(&self, name: &str) -> Option<&NodePool> {
        self.nodepools.iter().find(|p| p.name == name)
    }

    /// The claim backing a node.
    #[must_use]
    pub fn claim_for_node(&self, node: &str) -> Option<&NodeClaim> {
        self.claims
            .iter()
            .find(|c| c.node_name.as_deref() == Some(node))
    }
}

/// The synthetic node standing in for a claim whose node has not registered.
#[must_use]
pub fn in_flight_node(claim: &NodeClaim, registered: &[Node]) -> Option<Node> {
    if !matches!(claim.phase, ClaimPhase::Pending | ClaimPhase::Launched) {
        return None;
    }
    let known = registered.iter().any(|n| {
        claim.node_name.as_deref() == Some(n.name.as_str())
            || (claim.provider_id.is_some() && n.provider_id == claim.provider_id)
    });
    if known {
        return None;
    }
    let allocatable = claim.allocatable.saturating_sub(&claim.daemon_overhead);
    let node = launching_node(
        &claim.name,
        &claim.nodepool,
        &claim.requirements,
        (claim.capacity, allocatable),
        &claim.taints,
    )
    .with_created_at(claim.created_at);
    Some(node)
}

/// A node as it will look once launched: single-valued requirements become
/// labels and the template taints are applied. `resources` is
/// `(capacity, allocatable)`.
#[must_use]
pub fn launching_node(
    name: &str,
    nodepool: &str,
    requirements: &Requirements,
    resources: (Resources, Resources),
    taints: &[Taint],
) -> Node {
    let (capacity, allocatable) = resources;
    let mut node = Node::new(name).with_allocatable(allocatable);
    node.capacity = capacity;
    for (k, v) in requirements.single_valued_labels() {
        node = node.with_label(k, v);
    }
    node = node.with_label(LABEL_NODEPOOL, nodepool);
    for taint in taints {
        node = node.with_taint(taint.clone());
    }
    node
}
