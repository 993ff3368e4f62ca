//! The closed set of placement predicates.

use std::collections::BTreeSet;

use crate::pod::Pod;
use crate::requirements::{LABEL_ZONE, Requirements};
use crate::resources::Resources;
use crate::snapshot::StateNode;
use crate::taints::{Taint, untolerated};
use crate::topology::Topology;

/// What a predicate sees of a placement target: a live node or a claim
/// opened during simulation.
#[derive(Debug, Clone)]
pub struct NodeView {
    /// Host name (node name or claim name).
    pub name: String,
    /// Labels the target has or will have, as requirements.
    pub requirements: Requirements,
    /// Taints relevant to placement.
    pub taints: Vec<Taint>,
    /// Capacity still free.
    pub available: Resources,
    /// Zones the target is in or may still be placed in.
    pub zones: BTreeSet<String>,
}

impl NodeView {
    /// View of a node in the snapshot.
    #[must_use]
    pub fn from_state(sn: &StateNode) -> Self {
        Self {
            name: sn.name().to_string(),
            requirements: sn.requirements(),
            taints: sn.scheduling_taints(),
            available: sn.available(),
            zones: sn.node.zone().map(str::to_string).into_iter().collect(),
        }
    }

    /// Zones permitted by a requirement set, when it pins the zone to a finite set.
    #[must_use]
    pub fn zones_of(requirements: &Requirements) -> BTreeSet<String> {
        requirements
            .get(LABEL_ZONE)
            .filter(|r| r.operator() == crate::requirements::Operator::In)
            .map(|r| r.values().clone())
            .unwrap_or_default()
    }
}

/// A placement predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// Requests fit the free capacity.
    ResourceFit,
    /// Node selector and required node affinity.
    NodeAffinity,
    /// Every blocking taint is tolerated.
    TaintToleration,
    /// Required pod affinity.
    PodAffinity,
    /// Required pod anti-affinity, including that of placed pods.
    PodAntiAffinity,
    /// Hard topology spread.
    TopologySpread,
}

impl Predicate {
    /// Evaluation order: cheap label checks before topology counting.
    pub const ALL: [Self; 6] = [
        Self::ResourceFit,
        Self::NodeAffinity,
        Self::TaintToleration,
        Self::TopologySpread,
        Self::PodAffinity,
        Self::PodAntiAffinity,
    ];

    /// Returns true if `pod` may be placed on `node`.
    #[must_use]
    pub fn matches(self, pod: &Pod, node: &NodeView, topology: &Topology) -> bool {
        self.check(pod, node, topology).is_ok()
    }

    /// Like [`Self::matches`], returning a description of the failure.
    ///
    /// # Errors
    ///
    /// Returns why the predicate rejects the placement.
    pub fn check(self, pod: &Pod, node: &NodeView, topology: &Topology) -> Result<(), String> {
        match self {
            Self::ResourceFit => {
                let requests = pod.effective_requests();
                if requests.fits_in(&node.available) {
                    Ok(())
                } else {
                    Err(format!("requests {requests} exceed available {}", node.available))
                }
            }
            Self::NodeAffinity => {
                let mut first = None;
                for alt in pod.scheduling_requirements() {
                    match node.requirements.conflict(&alt) {
                        None => return Ok(()),
                        Some(c) => {
                            first.get_or_insert(c);
                        }
                    }
                }
                Err(first.unwrap_or_else(|| "node affinity not satisfied".to_string()))
            }
            Self::TaintToleration => match untolerated(&node.taints, &pod.tolerations) {
                Some(t) => Err(format!("untolerated taint {t}")),
                None => Ok(()),
            },
            Self::TopologySpread => topology.spread(pod, &node.name, &node.zones).map(drop),
            Self::PodAffinity => topology.affinity(pod, &node.name, &node.zones).map(drop),
            Self::PodAntiAffinity => topology.anti_affinity(pod, &node.name, &node.zones).map(drop),
        }
    }

    /// The first predicate in [`Self::ALL`] that rejects the placement.
    #[must_use]
    pub fn first_failure(pod: &Pod, node: &NodeView, topology: &Topology) -> Option<(Self, String)> {
        Self::ALL
            .iter()
            .find_map(|p| p.check(pod, node, topology).err().map(|e| (*p, e)))
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResourceFit => "resource fit",
            Self::NodeAffinity => "node affinity",
            Self::TaintToleration => "taint toleration",
            Self::PodAffinity => "pod affinity",
            Self::PodAntiAffinity => "pod anti-affinity",
            Self::TopologySpread => "topology spread",
        };
        f.write_str(s)
    }
}
