//! Scenario files for dry runs.
//!
//! A scenario is a JSON document describing NodePools, the instance types
//! the provider sells, and the nodes, pods, daemonsets and PDBs already in
//! the cluster. [`Scenario::build`] turns it into in-memory collaborators;
//! nodes that belong to a pool are adopted as `Ready` claims backed by
//! running instances.
//!
//! [`simulate_kube`] stands in for the kubelet and scheduler: it registers
//! nodes for running instances, removes nodes whose instance is gone and
//! binds pending pods to nodes with room.

use std::path::Path;
use std::sync::Arc;

use claw_provisioning::requirements::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE};
use claw_provisioning::{
    CapacityType, ClusterState, InstanceType, Node, NodePool, OfferingCatalog, PlacementTarget,
    Pod, simulate,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::{ClusterClient, InMemoryCluster, PodDisruptionBudget};
use crate::error::{ControllerError, Result};
use crate::lifecycle::{ClaimOffering, NodeClaim, NodeClaimStore};
use crate::provider::{InMemoryProvider, Instance, InstanceState};

/// A cluster and provider to run the controller against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// NodePools.
    #[serde(default)]
    pub nodepools: Vec<NodePool>,
    /// Instance types the provider offers to every pool.
    #[serde(default)]
    pub instance_types: Vec<InstanceType>,
    /// Existing nodes.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Existing pods, bound or pending.
    #[serde(default)]
    pub pods: Vec<Pod>,
    /// DaemonSet pod templates.
    #[serde(default)]
    pub daemonsets: Vec<Pod>,
    /// Disruption budgets.
    #[serde(default)]
    pub pdbs: Vec<PodDisruptionBudget>,
}

/// Collaborators seeded from a scenario.
pub type Seeded = (Arc<InMemoryProvider>, Arc<InMemoryCluster>, Arc<NodeClaimStore>);

impl Scenario {
    /// Loads a scenario from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ControllerError::Config {
            reason: format!(
                "failed to read scenario file '{}': {}",
                path.as_ref().display(),
                e
            ),
        })?;
        Self::from_json(&content)
    }

    /// Parses a scenario from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or a NodePool or instance
    /// type fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(content).map_err(|e| ControllerError::Config {
            reason: format!("invalid scenario: {e}"),
        })?;
        for pool in &scenario.nodepools {
            pool.validate()?;
        }
        for it in &scenario.instance_types {
            it.validate()?;
        }
        Ok(scenario)
    }

    /// Builds in-memory collaborators holding the scenario.
    ///
    /// # Errors
    ///
    /// Returns an error if two nodes claim the same provider instance.
    pub fn build(&self) -> Result<Seeded> {
        let provider = Arc::new(InMemoryProvider::new(self.instance_types.clone()));
        let store = Arc::new(NodeClaimStore::new());
        let mut cluster = InMemoryCluster::new();
        for pool in &self.nodepools {
            cluster = cluster.with_nodepool(pool.clone());
        }
        for pod in &self.pods {
            cluster = cluster.with_pod(pod.clone());
        }
        for template in &self.daemonsets {
            cluster = cluster.with_daemonset(template.clone());
        }
        for pdb in &self.pdbs {
            cluster = cluster.with_pdb(pdb.clone());
        }

        for node in &self.nodes {
            let mut node = node.clone();
            let zone = node.zone().unwrap_or("unknown").to_string();
            let provider_id = node
                .provider_id
                .get_or_insert_with(|| format!("mem:///{zone}/{}", node.name))
                .clone();
            if let Some(pool) = node
                .nodepool()
                .and_then(|name| self.nodepools.iter().find(|p| p.name == name))
            {
                let offering = self.offering_for(&node, &zone);
                let claim = NodeClaim::for_node(&node, pool, offering.clone());
                let claim_id = store.insert(claim)?;
                provider.adopt(Instance {
                    provider_id,
                    claim_id,
                    name: node.name.clone(),
                    instance_type: offering.instance_type,
                    zone,
                    capacity_type: offering.capacity_type,
                    state: InstanceState::Running,
                    capacity: node.capacity,
                    allocatable: node.allocatable,
                    labels: node.labels.clone(),
                    taints: node.taints.clone(),
                    launched_at: node.created_at,
                });
                debug!(node = %node.name, nodepool = %pool.name, "node adopted");
            }
            cluster = cluster.with_node(node);
        }

        Ok((provider, Arc::new(cluster), store))
    }

    fn offering_for(&self, node: &Node, zone: &str) -> ClaimOffering {
        let instance_type = node
            .labels
            .get(LABEL_INSTANCE_TYPE)
            .cloned()
            .unwrap_or_default();
        let capacity_type = match node.labels.get(LABEL_CAPACITY_TYPE).map(String::as_str) {
            Some("spot") => CapacityType::Spot,
            _ => CapacityType::OnDemand,
        };
        let price = self
            .instance_types
            .iter()
            .find(|it| it.name == instance_type)
            .and_then(|it| {
                it.offerings
                    .iter()
                    .find(|o| o.zone == zone && o.capacity_type == capacity_type)
            })
            .map_or(0.0, |o| o.price);
        ClaimOffering {
            instance_type,
            zone: zone.to_string(),
            capacity_type,
            price,
        }
    }
}

/// What one [`simulate_kube`] step changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeStep {
    /// Nodes registered for running instances.
    pub registered: Vec<String>,
    /// Nodes removed because their instance terminated.
    pub removed: Vec<String>,
    /// Pending pods bound to a node.
    pub bound: usize,
}

/// Advances the in-memory cluster by one kubelet and scheduler step.
///
/// New nodes register without the startup taints of their claim, so they
/// initialize on the next reconcile.
///
/// # Errors
///
/// Returns an error if a node cannot be deleted.
pub async fn simulate_kube(
    provider: &InMemoryProvider,
    cluster: &InMemoryCluster,
    store: &NodeClaimStore,
) -> Result<KubeStep> {
    let mut step = KubeStep::default();

    for instance in provider.instances() {
        let existing = cluster.node(&instance.name);
        match instance.state {
            InstanceState::Terminated => {
                if existing.is_some_and(|n| n.provider_id.as_deref() == Some(&instance.provider_id)) {
                    cluster.delete_node(&instance.name).await?;
                    step.removed.push(instance.name.clone());
                }
            }
            InstanceState::Pending | InstanceState::Running if existing.is_none() => {
                let startup = store
                    .get(instance.claim_id)
                    .map(|c| c.startup_taints)
                    .unwrap_or_default();
                let mut node = instance.to_node();
                node.taints.retain(|t| !startup.iter().any(|s| t.matches(s)));
                cluster.add_node(node);
                step.registered.push(instance.name.clone());
            }
            _ => {}
        }
    }

    let state = ClusterState::snapshot(cluster.nodes(), cluster.pods(), cluster.daemonsets());
    let pending = state.pending_pods();
    if !pending.is_empty() {
        let results = simulate(&pending, &state, &OfferingCatalog::new(), &[]);
        for placement in &results.placements {
            if let PlacementTarget::ExistingNode(node) = &placement.target {
                cluster.bind(&placement.pod, node);
                step.bound += 1;
            }
        }
    }

    Ok(step)
}
