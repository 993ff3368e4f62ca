//! Pod model: the scheduling-relevant subset of a Kubernetes pod.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;
use crate::taints::Toleration;

/// Annotation that opts a pod (and therefore its node) out of voluntary disruption.
pub const ANNOTATION_DO_NOT_DISRUPT: &str = "claw.dev/do-not-disrupt";
/// Annotation the kubelet sets on mirror pods of static manifests.
pub const ANNOTATION_MIRROR: &str = "kubernetes.io/config.mirror";

/// Namespaced pod identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl PodKey {
    /// Creates a pod key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not yet running.
    #[default]
    Pending,
    /// Bound and running.
    Running,
    /// Terminated successfully.
    Succeeded,
    /// Terminated with failure.
    Failed,
}

/// Reference to the controller that owns a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    /// Owner kind, e.g. `ReplicaSet`, `DaemonSet`, `Node`.
    pub kind: String,
    /// Owner name.
    pub name: String,
}

impl OwnerRef {
    /// Creates an owner reference.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Label selector with equality labels and set-based expressions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Labels that must be present with the given values.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based expressions.
    #[serde(default)]
    pub match_expressions: Requirements,
}

impl LabelSelector {
    /// Selector matching a single label.
    #[must_use]
    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(key.into(), value.into());
        Self {
            match_labels,
            match_expressions: Requirements::new(),
        }
    }

    /// Returns true if `labels` satisfy the selector. An empty selector matches everything.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.matches_labels(labels)
    }
}

/// A required pod (anti-)affinity term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    /// Pods the term refers to.
    pub selector: LabelSelector,
    /// Node label defining the topology domain (hostname, zone, ...).
    pub topology_key: String,
    /// Namespaces to consider; empty means the pod's own namespace.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl PodAffinityTerm {
    /// Creates a term over the pod's own namespace.
    #[must_use]
    pub fn new(selector: LabelSelector, topology_key: impl Into<String>) -> Self {
        Self {
            selector,
            topology_key: topology_key.into(),
            namespaces: Vec::new(),
        }
    }

    /// Returns true if `other` (in `other_ns`) is selected by this term of a pod in `own_ns`.
    #[must_use]
    pub fn selects(&self, own_ns: &str, other_ns: &str, labels: &BTreeMap<String, String>) -> bool {
        let ns_ok = if self.namespaces.is_empty() {
            own_ns == other_ns
        } else {
            self.namespaces.iter().any(|n| n == other_ns)
        };
        ns_ok && self.selector.matches(labels)
    }
}

/// What to do when a spread constraint cannot be met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WhenUnsatisfiable {
    /// Hard constraint.
    #[default]
    DoNotSchedule,
    /// Soft constraint; ignored by the simulator.
    ScheduleAnyway,
}

/// A topology spread constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    /// Maximum permitted difference between the most and least loaded domain.
    pub max_skew: u32,
    /// Node label defining the domain.
    pub topology_key: String,
    /// Hard or soft.
    #[serde(default)]
    pub when_unsatisfiable: WhenUnsatisfiable,
    /// Pods counted towards the spread.
    pub selector: LabelSelector,
}

impl TopologySpreadConstraint {
    /// Creates a hard constraint.
    #[must_use]
    pub fn new(max_skew: u32, topology_key: impl Into<String>, selector: LabelSelector) -> Self {
        Self {
            max_skew,
            topology_key: topology_key.into(),
            when_unsatisfiable: WhenUnsatisfiable::DoNotSchedule,
            selector,
        }
    }

    /// Returns true if the constraint is enforced.
    #[must_use]
    pub fn is_hard(&self) -> bool {
        self.when_unsatisfiable == WhenUnsatisfiable::DoNotSchedule
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A pod, reduced to what placement and disruption decisions look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Sum of container requests.
    #[serde(default)]
    pub requests: Resources,
    /// Phase.
    #[serde(default)]
    pub phase: PodPhase,
    /// Node the pod is bound to.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Equality node selector.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Required node affinity terms; at least one must hold.
    #[serde(default)]
    pub node_affinity: Vec<Requirements>,
    /// Required pod affinity terms.
    #[serde(default)]
    pub pod_affinity: Vec<PodAffinityTerm>,
    /// Required pod anti-affinity terms.
    #[serde(default)]
    pub pod_anti_affinity: Vec<PodAffinityTerm>,
    /// Tolerations.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Topology spread constraints.
    #[serde(default)]
    pub topology_spread: Vec<TopologySpreadConstraint>,
    /// Owning controller.
    #[serde(default)]
    pub owner: Option<OwnerRef>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: i32,
}

impl Pod {
    /// Creates a pending, unbound pod with no requests.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            requests: Resources::new(),
            phase: PodPhase::Pending,
            node_name: None,
            node_selector: BTreeMap::new(),
            node_affinity: Vec::new(),
            pod_affinity: Vec::new(),
            pod_anti_affinity: Vec::new(),
            tolerations: Vec::new(),
            topology_spread: Vec::new(),
            owner: None,
            priority: 0,
        }
    }

    /// Sets resource requests.
    #[must_use]
    pub fn with_requests(mut self, requests: Resources) -> Self {
        self.requests = requests;
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Adds a node selector entry.
    #[must_use]
    pub fn with_node_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    /// Adds a required node affinity term.
    #[must_use]
    pub fn with_node_affinity(mut self, term: Requirements) -> Self {
        self.node_affinity.push(term);
        self
    }

    /// Adds a required pod affinity term.
    #[must_use]
    pub fn with_pod_affinity(mut self, term: PodAffinityTerm) -> Self {
        self.pod_affinity.push(term);
        self
    }

    /// Adds a required pod anti-affinity term.
    #[must_use]
    pub fn with_pod_anti_affinity(mut self, term: PodAffinityTerm) -> Self {
        self.pod_anti_affinity.push(term);
        self
    }

    /// Adds a toleration.
    #[must_use]
    pub fn with_toleration(mut self, toleration: Toleration) -> Self {
        self.tolerations.push(toleration);
        self
    }

    /// Adds a topology spread constraint.
    #[must_use]
    pub fn with_topology_spread(mut self, constraint: TopologySpreadConstraint) -> Self {
        self.topology_spread.push(constraint);
        self
    }

    /// Sets the owning controller.
    #[must_use]
    pub fn with_owner(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.owner = Some(OwnerRef::new(kind, name));
        self
    }

    /// Binds the pod to a node and marks it running.
    #[must_use]
    pub fn bound_to(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self.phase = PodPhase::Running;
        self
    }

    /// The pod's namespaced identity.
    #[must_use]
    pub fn key(&self) -> PodKey {
        PodKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Requests including the pod slot the pod occupies.
    #[must_use]
    pub fn effective_requests(&self) -> Resources {
        self.requests.with_pods(self.requests.pods.max(1))
    }

    /// Alternative requirement sets, one per node-affinity term, each combined
    /// with the node selector. A node must satisfy at least one.
    #[must_use]
    pub fn scheduling_requirements(&self) -> Vec<Requirements> {
        let base: Requirements = self
            .node_selector
            .iter()
            .map(|(k, v)| Requirement::in_values(k.clone(), [v.clone()]))
            .collect();
        if self.node_affinity.is_empty() {
            return vec![base];
        }
        self.node_affinity.iter().map(|t| base.intersect(t)).collect()
    }

    /// Returns true if the pod is owned by a DaemonSet.
    #[must_use]
    pub fn is_daemonset(&self) -> bool {
        self.owner.as_ref().is_some_and(|o| o.kind == "DaemonSet")
    }

    /// Returns true for mirror (static) pods, which cannot be evicted.
    #[must_use]
    pub fn is_mirror(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_MIRROR)
            || self.owner.as_ref().is_some_and(|o| o.kind == "Node")
    }

    /// Returns true if the pod opts out of voluntary disruption.
    #[must_use]
    pub fn do_not_disrupt(&self) -> bool {
        self.annotations
            .get(ANNOTATION_DO_NOT_DISRUPT)
            .is_some_and(|v| v == "true")
    }

    /// Returns true once the pod has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Returns true for pending pods not yet bound to a node.
    #[must_use]
    pub fn is_unbound(&self) -> bool {
        self.node_name.is_none() && self.phase == PodPhase::Pending
    }

    /// Key grouping pods whose placement constraints are identical.
    #[must_use]
    pub fn signature(&self) -> SchedulingSignature {
        SchedulingSignature {
            namespace: self.namespace.clone(),
            labels: self.labels.clone(),
            node_selector: self.node_selector.clone(),
            node_affinity: self.node_affinity.clone(),
            pod_affinity: self.pod_affinity.clone(),
            pod_anti_affinity: self.pod_anti_affinity.clone(),
            tolerations: self.tolerations.clone(),
            topology_spread: self.topology_spread.clone(),
        }
    }
}

/// Everything about a pod that influences where it may be placed, except its
/// resource requests. Pods with equal signatures are interchangeable to the
/// constraint checks, so feasibility work is shared between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchedulingSignature {
    namespace: String,
    labels: BTreeMap<String, String>,
    node_selector: BTreeMap<String, String>,
    node_affinity: Vec<Requirements>,
    pod_affinity: Vec<PodAffinityTerm>,
    pod_anti_affinity: Vec<PodAffinityTerm>,
    tolerations: Vec<Toleration>,
    topology_spread: Vec<TopologySpreadConstraint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::{LABEL_ARCH, LABEL_ZONE};

    #[test]
    fn key_display() {
        let pod = Pod::new("prod", "web-0");
        assert_eq!(pod.key().to_string(), "prod/web-0");
    }

    #[test]
    fn effective_requests_reserve_a_slot() {
        let pod = Pod::new("default", "p").with_requests(Resources::new().with_cpu(1));
        assert_eq!(pod.effective_requests().pods, 1);
        assert_eq!(pod.effective_requests().cpu_millis, 1000);
    }

    #[test]
    fn scheduling_requirements_combine_selector_and_terms() {
        let pod = Pod::new("default", "p")
            .with_node_selector(LABEL_ARCH, "arm64")
            .with_node_affinity(
                Requirements::new().with(Requirement::in_values(LABEL_ZONE, ["zone-a"])),
            )
            .with_node_affinity(
                Requirements::new().with(Requirement::in_values(LABEL_ZONE, ["zone-b"])),
            );
        let alternatives = pod.scheduling_requirements();
        assert_eq!(alternatives.len(), 2);
        for alt in &alternatives {
            assert_eq!(alt.get(LABEL_ARCH).and_then(Requirement::single_value), Some("arm64"));
        }
    }

    #[test]
    fn classification_helpers() {
        let ds = Pod::new("kube-system", "agent").with_owner("DaemonSet", "agent");
        assert!(ds.is_daemonset());

        let mirror = Pod::new("kube-system", "etcd").with_annotation(ANNOTATION_MIRROR, "x");
        assert!(mirror.is_mirror());

        let pinned = Pod::new("default", "db").with_annotation(ANNOTATION_DO_NOT_DISRUPT, "true");
        assert!(pinned.do_not_disrupt());

        let running = Pod::new("default", "web").bound_to("node-1");
        assert!(!running.is_unbound());
    }

    #[test]
    fn label_selector_matching() {
        let sel = LabelSelector::label("app", "web");
        let mut labels = BTreeMap::new();
        assert!(!sel.matches(&labels));
        labels.insert("app".to_string(), "web".to_string());
        assert!(sel.matches(&labels));
        assert!(LabelSelector::default().matches(&BTreeMap::new()));
    }

    #[test]
    fn affinity_term_namespace_scoping() {
        let term = PodAffinityTerm::new(LabelSelector::label("app", "db"), LABEL_ZONE);
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "db".to_string());
        assert!(term.selects("prod", "prod", &labels));
        assert!(!term.selects("prod", "dev", &labels));
    }

    #[test]
    fn signatures_ignore_requests() {
        let a = Pod::new("default", "a").with_requests(Resources::new().with_cpu(1));
        let b = Pod::new("default", "b").with_requests(Resources::new().with_cpu(4));
        assert_eq!(a.signature(), b.signature());

        let c = b.clone().with_label("app", "other");
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn deserializes_minimal_json() {
        let pod: Pod = serde_json::from_str(r#"{"name":"p","requests":{"cpu_millis":500}}"#)
            .expect("deserialize");
        assert_eq!(pod.namespace, "default");
        assert_eq!(pod.requests.cpu_millis, 500);
        assert!(pod.is_unbound());
    }
}
