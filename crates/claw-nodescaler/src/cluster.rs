//! Cluster API collaborator.
//!
//! Read access to nodes, pods, daemonsets, NodePools and disruption budgets,
//! plus the writes the controller needs: taints, evictions, node deletion,
//! pod conditions and NodeClaim/NodePool status.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use claw_provisioning::{LabelSelector, Node, NodePool, Pod, PodKey, PodPhase, Resources, Taint};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ControllerError, Result};
use crate::lifecycle::{ClaimId, NodeClaim};

/// A pod disruption budget as computed by the API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    /// Namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Pods covered.
    #[serde(default)]
    pub selector: LabelSelector,
    /// Evictions currently allowed.
    #[serde(default)]
    pub disruptions_allowed: u32,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl PodDisruptionBudget {
    /// Creates a budget.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        selector: LabelSelector,
        disruptions_allowed: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            selector,
            disruptions_allowed,
        }
    }

    /// Returns true if the budget covers `pod`.
    #[must_use]
    pub fn covers(&self, pod: &Pod) -> bool {
        self.namespace == pod.namespace && self.selector.matches(&pod.labels)
    }
}

/// Result of an eviction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The pod is gone or going.
    Evicted,
    /// The API refused the eviction.
    Blocked {
        /// Why.
        reason: String,
    },
}

/// Pod-level `Unschedulable` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unschedulable {
    /// Why the pod cannot be placed.
    pub reason: String,
    /// When the condition was set.
    pub last_transition: DateTime<Utc>,
}

/// NodePool status summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolStatus {
    /// Capacity of the pool's nodes and in-flight claims.
    pub usage: Resources,
    /// Node count.
    pub nodes: usize,
}

/// Cluster operations the controller depends on.
pub trait ClusterClient: Send + Sync + 'static {
    /// All nodes.
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Node>>> + Send;

    /// All pods, bound or not.
    fn list_pods(&self) -> impl Future<Output = Result<Vec<Pod>>> + Send;

    /// Daemonset pod templates.
    fn list_daemonsets(&self) -> impl Future<Output = Result<Vec<Pod>>> + Send;

    /// NodePools.
    fn list_nodepools(&self) -> impl Future<Output = Result<Vec<NodePool>>> + Send;

    /// Pod disruption budgets.
    fn list_pdbs(&self) -> impl Future<Output = Result<Vec<PodDisruptionBudget>>> + Send;

    /// The node registered for a provider instance.
    fn node_by_provider_id(&self, provider_id: &str) -> impl Future<Output = Result<Option<Node>>> + Send;

    /// Adds a taint unless an equal one is present.
    fn taint_node(&self, node: &str, taint: &Taint) -> impl Future<Output = Result<()>> + Send;

    /// Removes taints with `key`.
    fn untaint_node(&self, node: &str, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Deletes a node object. Deleting a missing node succeeds.
    fn delete_node(&self, node: &str) -> impl Future<Output = Result<()>> + Send;

    /// Requests an eviction, honouring pod disruption budgets.
    fn evict(&self, pod: &PodKey) -> impl Future<Output = Result<EvictionOutcome>> + Send;

    /// Deletes a pod without consulting disruption budgets.
    fn delete_pod(&self, pod: &PodKey) -> impl Future<Output = Result<()>> + Send;

    /// Sets the pod's `Unschedulable` condition.
    fn mark_unschedulable(&self, pod: &PodKey, reason: &str) -> impl Future<Output = Result<()>> + Send;

    /// Clears the pod's `Unschedulable` condition.
    fn clear_unschedulable(&self, pod: &PodKey) -> impl Future<Output = Result<()>> + Send;

    /// Publishes a claim's status.
    fn upsert_claim(&self, claim: &NodeClaim) -> impl Future<Output = Result<()>> + Send;

    /// Publishes a NodePool's status.
    fn update_nodepool_status(
        &self,
        pool: &str,
        status: NodePoolStatus,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct ClusterInner {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<PodKey, Pod>,
    daemonsets: Vec<Pod>,
    nodepools: Vec<NodePool>,
    pdbs: Vec<PodDisruptionBudget>,
    unschedulable: BTreeMap<PodKey, Unschedulable>,
    claims: BTreeMap<ClaimId, NodeClaim>,
    pool_status: BTreeMap<String, NodePoolStatus>,
}

impl ClusterInner {
    /// Removes a pod; workload pods come back unbound as their controller
    /// would recreate them.
    fn remove_pod(&mut self, key: &PodKey) {
        let Some(pod) = self.pods.remove(key) else {
            return;
        };
        let recreated = pod
            .owner
            .as_ref()
            .is_some_and(|o| o.kind != "DaemonSet" && o.kind != "Node");
        if recreated && !pod.is_terminal() {
            let mut fresh = pod;
            fresh.node_name = None;
            fresh.phase = PodPhase::Pending;
            self.pods.insert(key.clone(), fresh);
        }
    }
}

/// Cluster backed by memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    inner: RwLock<ClusterInner>,
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(self, node: Node) -> Self {
        self.add_node(node);
        self
    }

    /// Adds a pod.
    #[must_use]
    pub fn with_pod(self, pod: Pod) -> Self {
        self.add_pod(pod);
        self
    }

    /// Adds a daemonset template.
    #[must_use]
    pub fn with_daemonset(self, template: Pod) -> Self {
        self.inner.write().daemonsets.push(template);
        self
    }

    /// Adds a NodePool.
    #[must_use]
    pub fn with_nodepool(self, pool: NodePool) -> Self {
        self.inner.write().nodepools.push(pool);
        self
    }

    /// Adds a pod disruption budget.
    #[must_use]
    pub fn with_pdb(self, pdb: PodDisruptionBudget) -> Self {
        self.inner.write().pdbs.push(pdb);
        self
    }

    /// Adds or replaces a node.
    pub fn add_node(&self, node: Node) {
        self.inner.write().nodes.insert(node.name.clone(), node);
    }

    /// Adds or replaces a pod.
    pub fn add_pod(&self, pod: Pod) {
        self.inner.write().pods.insert(pod.key(), pod);
    }

    /// Replaces a NodePool definition.
    pub fn replace_nodepool(&self, pool: NodePool) {
        let mut inner = self.inner.write();
        inner.nodepools.retain(|p| p.name != pool.name);
        inner.nodepools.push(pool);
    }

    /// Binds a pod to a node and marks it running.
    pub fn bind(&self, pod: &PodKey, node: &str) {
        let mut inner = self.inner.write();
        inner.unschedulable.remove(pod);
        if let Some(p) = inner.pods.get_mut(pod) {
            p.node_name = Some(node.to_string());
            p.phase = PodPhase::Running;
        }
    }

    /// Sets a node's readiness.
    pub fn set_ready(&self, node: &str, ready: bool) {
        if let Some(n) = self.inner.write().nodes.get_mut(node) {
            n.ready = ready;
        }
    }

    /// A copy of a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        self.inner.read().nodes.get(name).cloned()
    }

    /// Copies of all nodes.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// A copy of a pod.
    #[must_use]
    pub fn pod(&self, key: &PodKey) -> Option<Pod> {
        self.inner.read().pods.get(key).cloned()
    }

    /// Copies of all pods.
    #[must_use]
    pub fn pods(&self) -> Vec<Pod> {
        self.inner.read().pods.values().cloned().collect()
    }

    /// Copies of the NodePools.
    #[must_use]
    pub fn nodepools(&self) -> Vec<NodePool> {
        self.inner.read().nodepools.clone()
    }

    /// Copies of the daemonset templates.
    #[must_use]
    pub fn daemonsets(&self) -> Vec<Pod> {
        self.inner.read().daemonsets.clone()
    }

    /// The pod's `Unschedulable` condition.
    #[must_use]
    pub fn unschedulable(&self, pod: &PodKey) -> Option<Unschedulable> {
        self.inner.read().unschedulable.get(pod).cloned()
    }

    /// The last published status of a claim.
    #[must_use]
    pub fn claim(&self, id: ClaimId) -> Option<NodeClaim> {
        self.inner.read().claims.get(&id).cloned()
    }

    /// The last published status of a NodePool.
    #[must_use]
    pub fn nodepool_status(&self, pool: &str) -> Option<NodePoolStatus> {
        self.inner.read().pool_status.get(pool).cloned()
    }
}

impl ClusterClient for InMemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods())
    }

    async fn list_daemonsets(&self) -> Result<Vec<Pod>> {
        Ok(self.daemonsets())
    }

    async fn list_nodepools(&self) -> Result<Vec<NodePool>> {
        Ok(self.nodepools())
    }

    async fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>> {
        Ok(self.inner.read().pdbs.clone())
    }

    async fn node_by_provider_id(&self, provider_id: &str) -> Result<Option<Node>> {
        Ok(self
            .inner
            .read()
            .nodes
            .values()
            .find(|n| n.provider_id.as_deref() == Some(provider_id))
            .cloned())
    }

    async fn taint_node(&self, node: &str, taint: &Taint) -> Result<()> {
        let mut inner = self.inner.write();
        let n = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| ControllerError::cluster(format!("node {node} not found")))?;
        if !n.taints.iter().any(|t| t.matches(taint)) {
            n.taints.push(taint.clone());
            debug!(node, taint = %taint, "node tainted");
        }
        Ok(())
    }

    async fn untaint_node(&self, node: &str, key: &str) -> Result<()> {
        if let Some(n) = self.inner.write().nodes.get_mut(node) {
            n.taints.retain(|t| t.key != key);
        }
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.nodes.remove(node).is_some() {
            info!(node, "node deleted");
        }
        let orphaned: Vec<PodKey> = inner
            .pods
            .values()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .map(Pod::key)
            .collect();
        for key in orphaned {
            inner.remove_pod(&key);
        }
        Ok(())
    }

    async fn evict(&self, pod: &PodKey) -> Result<EvictionOutcome> {
        let mut inner = self.inner.write();
        let Some(p) = inner.pods.get(pod).cloned() else {
            return Ok(EvictionOutcome::Evicted);
        };
        if p.is_mirror() {
            return Ok(EvictionOutcome::Blocked {
                reason: "mirror pods cannot be evicted".to_string(),
            });
        }
        let covering: Vec<usize> = inner
            .pdbs
            .iter()
            .enumerate()
            .filter(|(_, pdb)| pdb.covers(&p))
            .map(|(i, _)| i)
            .collect();
        if let Some(i) = covering.iter().find(|i| inner.pdbs[**i].disruptions_allowed == 0) {
            let pdb = &inner.pdbs[*i];
            return Ok(EvictionOutcome::Blocked {
                reason: format!("disruption budget {}/{} allows no evictions", pdb.namespace, pdb.name),
            });
        }
        for i in covering {
            inner.pdbs[i].disruptions_allowed -= 1;
        }
        inner.remove_pod(pod);
        debug!(pod = %pod, "pod evicted");
        Ok(EvictionOutcome::Evicted)
    }

    async fn delete_pod(&self, pod: &PodKey) -> Result<()> {
        self.inner.write().remove_pod(pod);
        debug!(pod = %pod, "pod deleted");
        Ok(())
    }

    async fn mark_unschedulable(&self, pod: &PodKey, reason: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let entry = inner
            .unschedulable
            .entry(pod.clone())
            .or_insert_with(|| Unschedulable {
                reason: reason.to_string(),
                last_transition: now,
            });
        entry.reason = reason.to_string();
        Ok(())
    }

    async fn clear_unschedulable(&self, pod: &PodKey) -> Result<()> {
        self.inner.write().unschedulable.remove(pod);
        Ok(())
    }

    async fn upsert_claim(&self, claim: &NodeClaim) -> Result<()> {
        self.inner.write().claims.insert(claim.id, claim.clone());
        Ok(())
    }

    async fn update_nodepool_status(&self, pool: &str, status: NodePoolStatus) -> Result<()> {
        self.inner.write().pool_status.insert(pool.to_string(), status);
        Ok(())
    }
}
