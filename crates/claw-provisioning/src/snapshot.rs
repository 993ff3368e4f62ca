//! Point-in-time cluster view used by one reconciliation pass.

use std::collections::{BTreeMap, BTreeSet};

use crate::node::Node;
use crate::nodepool::NodePool;
use crate::offering::DEFAULT_MAX_PODS;
use crate::pod::{Pod, PodKey, PodPhase};
use crate::requirements::Requirements;
use crate::resources::Resources;
use crate::taints::{Taint, untolerated};

/// A node together with what is already bound to it.
#[derive(Debug, Clone)]
pub struct StateNode {
    /// The node object.
    pub node: Node,
    /// Non-terminal pods bound to the node, in key order.
    pub pods: Vec<PodKey>,
    /// Sum of those pods' effective requests.
    pub requested: Resources,
    /// Synthetic node standing in for a launched claim that has not registered.
    pub in_flight: bool,
}

impl StateNode {
    fn new(node: Node, in_flight: bool) -> Self {
        Self {
            node,
            pods: Vec::new(),
            requested: Resources::new(),
            in_flight,
        }
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Allocatable capacity, with the kubelet pod default when none is reported.
    #[must_use]
    pub fn allocatable(&self) -> Resources {
        let alloc = self.node.allocatable;
        if alloc.pods == 0 {
            alloc.with_pods(DEFAULT_MAX_PODS)
        } else {
            alloc
        }
    }

    /// Capacity not yet requested by bound pods.
    #[must_use]
    pub fn available(&self) -> Resources {
        self.allocatable().saturating_sub(&self.requested)
    }

    /// Node labels as requirements.
    #[must_use]
    pub fn requirements(&self) -> Requirements {
        self.node.requirements()
    }

    /// Taints that matter for placement. Health taints are dropped for nodes
    /// that are still coming up, since they are expected to clear.
    #[must_use]
    pub fn scheduling_taints(&self) -> Vec<Taint> {
        let starting = self.in_flight || !self.node.ready;
        self.node
            .taints
            .iter()
            .filter(|t| !(starting && t.is_ephemeral()))
            .cloned()
            .collect()
    }
}

/// Immutable view of nodes, pods and daemonset templates.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    nodes: BTreeMap<String, StateNode>,
    pods: BTreeMap<PodKey, Pod>,
    daemonsets: Vec<Pod>,
}

impl ClusterState {
    /// Builds a consistent snapshot. Non-terminal pods bound to known nodes
    /// are charged against those nodes.
    #[must_use]
    pub fn snapshot(nodes: Vec<Node>, pods: Vec<Pod>, daemonsets: Vec<Pod>) -> Self {
        let mut state = Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.name.clone(), StateNode::new(n, false)))
                .collect(),
            pods: BTreeMap::new(),
            daemonsets,
        };
        for pod in pods {
            state.insert_pod(pod);
        }
        state
    }

    fn insert_pod(&mut self, pod: Pod) {
        let key = pod.key();
        if !pod.is_terminal() {
            if let Some(sn) = pod.node_name.as_ref().and_then(|n| self.nodes.get_mut(n)) {
                sn.requested = sn.requested.add(&pod.effective_requests());
                sn.pods.push(key.clone());
                sn.pods.sort();
            }
        }
        self.pods.insert(key, pod);
    }

    /// Adds a synthetic node for capacity that is launching but not yet registered.
    #[must_use]
    pub fn with_in_flight(mut self, node: Node) -> Self {
        self.nodes.insert(node.name.clone(), StateNode::new(node, true));
        self
    }

    /// Nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes.values()
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&StateNode> {
        self.nodes.get(name)
    }

    /// Looks up a pod.
    #[must_use]
    pub fn pod(&self, key: &PodKey) -> Option<&Pod> {
        self.pods.get(key)
    }

    /// All pods in key order.
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    /// Daemonset pod templates.
    #[must_use]
    pub fn daemonsets(&self) -> &[Pod] {
        &self.daemonsets
    }

    /// Non-terminal pods bound to `node`.
    pub fn pods_on<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a Pod> + 'a {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|sn| sn.pods.iter())
            .filter_map(|k| self.pods.get(k))
    }

    /// Pods waiting for a node, excluding daemonset pods.
    #[must_use]
    pub fn pending_pods(&self) -> Vec<Pod> {
        self.pods
            .values()
            .filter(|p| p.is_unbound() && !p.is_daemonset())
            .cloned()
            .collect()
    }

    /// Requests every node launched for `pool` must reserve for daemonsets
    /// that would land on it.
    #[must_use]
    pub fn daemon_overhead(&self, pool: &NodePool) -> Resources {
        let pool_reqs = pool.node_requirements();
        self.daemonsets
            .iter()
            .filter(|ds| untolerated(&pool.template.taints, &ds.tolerations).is_none())
            .filter(|ds| {
                ds.scheduling_requirements()
                    .iter()
                    .any(|alt| pool_reqs.shared_conflict(alt).is_none())
            })
            .map(Pod::effective_requests)
            .sum()
    }

    /// Capacity of the pool's existing and in-flight nodes.
    #[must_use]
    pub fn nodepool_usage(&self, pool: &str) -> Resources {
        self.nodes
            .values()
            .filter(|sn| sn.node.nodepool() == Some(pool))
            .map(|sn| sn.node.capacity)
            .sum()
    }

    /// Number of nodes belonging to the pool.
    #[must_use]
    pub fn nodepool_size(&self, pool: &str) -> usize {
        self.nodes
            .values()
            .filter(|sn| sn.node.nodepool() == Some(pool))
            .count()
    }

    /// A copy of the state with `names` removed. The workload pods they held
    /// are returned unbound, ready to be re-simulated; daemonset pods vanish
    /// with their node.
    #[must_use]
    pub fn without_nodes(&self, names: &[String]) -> (Self, Vec<Pod>) {
        let removed: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let mut nodes = self.nodes.clone();
        nodes.retain(|name, _| !removed.contains(name.as_str()));

        let mut pods = BTreeMap::new();
        let mut displaced = Vec::new();
        for (key, pod) in &self.pods {
            let on_removed = pod
                .node_name
                .as_deref()
                .is_some_and(|n| removed.contains(n));
            if !on_removed {
                pods.insert(key.clone(), pod.clone());
            } else if !pod.is_daemonset() && !pod.is_terminal() {
                let mut moved = pod.clone();
                moved.node_name = None;
                moved.phase = PodPhase::Pending;
                displaced.push(moved);
            }
        }

        let state = Self {
            nodes,
            pods,
            daemonsets: self.daemonsets.clone(),
        };
        (state, displaced)
    }

    /// A copy of the state with `launching` added as in-flight nodes and
    /// `pods` inserted afterwards, so pods bound to the new nodes are charged
    /// against them. Used to project what a disruption leaves behind.
    #[must_use]
    pub fn with_projected(&self, launching: Vec<Node>, pods: Vec<Pod>) -> Self {
        let mut state = self.clone();
        for node in launching {
            state.nodes.insert(node.name.clone(), StateNode::new(node, true));
        }
        for pod in pods {
            state.insert_pod(pod);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::{LABEL_NODEPOOL, Requirement};
    use crate::taints::{TAINT_NOT_READY, TaintEffect, Toleration};

    fn node(name: &str) -> Node {
        Node::new(name)
            .with_label(LABEL_NODEPOOL, "default")
            .with_allocatable(Resources::new().with_cpu(4).with_memory_gib(8).with_pods(10))
    }

    fn pod(name: &str, cpu: u64) -> Pod {
        Pod::new("default", name).with_requests(Resources::new().with_cpu(cpu))
    }

    #[test]
    fn bound_pods_are_charged() {
        let state = ClusterState::snapshot(
            vec![node("n1")],
            vec![pod("a", 1).bound_to("n1"), pod("b", 2).bound_to("n1"), pod("c", 1)],
            vec![],
        );
        let sn = state.node("n1").expect("node");
        assert_eq!(sn.available().cpu_millis, 1000);
        assert_eq!(sn.available().pods, 8);
        assert_eq!(state.pods_on("n1").count(), 2);
        assert_eq!(state.pending_pods().len(), 1);
    }

    #[test]
    fn terminal_pods_are_not_charged() {
        let mut done = pod("done", 3).bound_to("n1");
        done.phase = PodPhase::Succeeded;
        let state = ClusterState::snapshot(vec![node("n1")], vec![done], vec![]);
        assert_eq!(state.node("n1").map(|n| n.available().cpu_millis), Some(4000));
    }

    #[test]
    fn daemon_overhead_respects_taints_and_selectors() {
        let pool = NodePool::new("gpu").with_taint(Taint::new("gpu", TaintEffect::NoSchedule));
        let tolerant = pod("logs", 1)
            .with_owner("DaemonSet", "logs")
            .with_toleration(Toleration::everything());
        let intolerant = pod("metrics", 1).with_owner("DaemonSet", "metrics");
        let elsewhere = pod("edge", 1)
            .with_owner("DaemonSet", "edge")
            .with_toleration(Toleration::everything())
            .with_node_affinity(
                Requirements::new().with(Requirement::in_values(LABEL_NODEPOOL, ["edge"])),
            );
        let state = ClusterState::snapshot(vec![], vec![], vec![tolerant, intolerant, elsewhere]);
        let overhead = state.daemon_overhead(&pool);
        assert_eq!(overhead.cpu_millis, 1000);
        assert_eq!(overhead.pods, 1);
    }

    #[test]
    fn without_nodes_displaces_workload_pods() {
        let ds = pod("agent", 0).with_owner("DaemonSet", "agent").bound_to("n1");
        let state = ClusterState::snapshot(
            vec![node("n1"), node("n2")],
            vec![pod("a", 1).bound_to("n1"), pod("b", 1).bound_to("n2"), ds],
            vec![],
        );
        let (after, displaced) = state.without_nodes(&["n1".to_string()]);
        assert!(after.node("n1").is_none());
        assert_eq!(displaced.len(), 1);
        assert!(displaced[0].is_unbound());
        assert!(after.pod(&PodKey::new("default", "agent")).is_none());
        assert_eq!(after.pods().count(), 1);
        assert_eq!(state.nodes().count(), 2);
    }

    #[test]
    fn projected_nodes_are_charged_for_rebound_pods() {
        let state = ClusterState::snapshot(vec![node("n1")], vec![pod("a", 1).bound_to("n1")], vec![]);
        let (after, displaced) = state.without_nodes(&["n1".to_string()]);
        let rebound: Vec<Pod> = displaced.into_iter().map(|p| p.bound_to("replacement")).collect();
        let projected = after.with_projected(vec![node("replacement")], rebound);
        let sn = projected.node("replacement").expect("node");
        assert!(sn.in_flight);
        assert_eq!(sn.available().cpu_millis, 3000);
        assert!(projected.pending_pods().is_empty());
    }

    #[test]
    fn in_flight_nodes_ignore_health_taints() {
        let launching = node("claim-1").with_taint(Taint::new(TAINT_NOT_READY, TaintEffect::NoSchedule));
        let state = ClusterState::default().with_in_flight(launching);
        let sn = state.node("claim-1").expect("node");
        assert!(sn.in_flight);
        assert!(sn.scheduling_taints().is_empty());
    }

    #[test]
    fn nodepool_usage_sums_capacity() {
        let state = ClusterState::snapshot(vec![node("n1"), node("n2")], vec![], vec![]);
        assert_eq!(state.nodepool_usage("default").cpu_millis, 8000);
        assert_eq!(state.nodepool_size("default"), 2);
        assert_eq!(state.nodepool_size("other"), 0);
    }
}
