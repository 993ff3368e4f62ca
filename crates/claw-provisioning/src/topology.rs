//! Topology bookkeeping for spread, affinity and anti-affinity.
//!
//! Two domains are modelled: the host (`kubernetes.io/hostname`) and the zone
//! (`topology.kubernetes.io/zone`). Terms on any other key are not enforced.
//! The tracker starts from the pods already bound in the cluster and is
//! updated as the simulator places pods, so constraints see the evolving
//! assignment rather than only live state.

use std::collections::{BTreeMap, BTreeSet};

use crate::pod::{Pod, PodAffinityTerm};
use crate::requirements::{LABEL_HOSTNAME, LABEL_ZONE};
use crate::snapshot::ClusterState;

#[derive(Debug, Clone)]
struct PlacedPod {
    namespace: String,
    labels: BTreeMap<String, String>,
    host: String,
    zone: Option<String>,
    anti_affinity: Vec<PodAffinityTerm>,
}

/// Placed pods indexed for domain counting.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    placed: Vec<PlacedPod>,
    zones: BTreeSet<String>,
}

impl Topology {
    /// Creates an empty tracker over the given zone universe.
    #[must_use]
    pub fn new(zones: impl IntoIterator<Item = String>) -> Self {
        Self {
            placed: Vec::new(),
            zones: zones.into_iter().collect(),
        }
    }

    /// Seeds the tracker from every non-terminal bound pod in `state`.
    /// `extra_zones` adds domains that only exist in the offering catalog.
    #[must_use]
    pub fn from_state(state: &ClusterState, extra_zones: impl IntoIterator<Item = String>) -> Self {
        let mut topo = Self::new(extra_zones);
        for sn in state.nodes() {
            if let Some(z) = sn.node.zone() {
                topo.zones.insert(z.to_string());
            }
            for pod in state.pods_on(sn.name()) {
                topo.record(pod, sn.name(), sn.node.zone());
            }
        }
        topo
    }

    /// Records a placement.
    pub fn record(&mut self, pod: &Pod, host: &str, zone: Option<&str>) {
        if let Some(z) = zone {
            self.zones.insert(z.to_string());
        }
        self.placed.push(PlacedPod {
            namespace: pod.namespace.clone(),
            labels: pod.labels.clone(),
            host: host.to_string(),
            zone: zone.map(str::to_string),
            anti_affinity: pod.pod_anti_affinity.clone(),
        });
    }

    /// Assigns a zone to pods placed on `host` before its zone was decided.
    pub fn set_host_zone(&mut self, host: &str, zone: &str) {
        self.zones.insert(zone.to_string());
        for p in self.placed.iter_mut().filter(|p| p.host == host && p.zone.is_none()) {
            p.zone = Some(zone.to_string());
        }
    }

    /// Returns true if `pod` has any zone-scoped constraint.
    #[must_use]
    pub fn has_zone_constraints(pod: &Pod) -> bool {
        pod.topology_spread
            .iter()
            .any(|c| c.is_hard() && c.topology_key == LABEL_ZONE)
            || pod
                .pod_affinity
                .iter()
                .chain(&pod.pod_anti_affinity)
                .any(|t| t.topology_key == LABEL_ZONE)
    }

    /// Zones among `zones` where hard spread constraints still allow `pod`
    /// on `host`. An error describes the violated constraint.
    ///
    /// # Errors
    ///
    /// Returns the reason when no zone (or the host itself) is allowed.
    pub fn spread(&self, pod: &Pod, host: &str, zones: &BTreeSet<String>) -> Result<BTreeSet<String>, String> {
        let mut allowed = zones.clone();
        for c in pod.topology_spread.iter().filter(|c| c.is_hard()) {
            let selects = |p: &PlacedPod| p.namespace == pod.namespace && c.selector.matches(&p.labels);
            if c.topology_key == LABEL_HOSTNAME {
                // A fresh host always exists, so the minimum is zero.
                let on_host = self.placed.iter().filter(|p| p.host == host && selects(*p)).count();
                if on_host + 1 > c.max_skew as usize {
                    return Err(format!("hostname spread of {} exceeded on {host}", c.max_skew));
                }
            } else if c.topology_key == LABEL_ZONE {
                let counts = self.zone_counts(selects);
                let eligible = self.eligible_zones(pod);
                let domains = if eligible.is_empty() { zones } else { &eligible };
                let min = domains
                    .iter()
                    .map(|z| counts.get(z.as_str()).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                allowed.retain(|z| {
                    counts.get(z.as_str()).copied().unwrap_or(0) + 1 <= min + c.max_skew as usize
                });
                if allowed.is_empty() {
                    return Err(format!("zone spread of {} cannot be satisfied", c.max_skew));
                }
            }
        }
        Ok(allowed)
    }

    /// Zones among `zones` satisfying required pod affinity on `host`.
    ///
    /// # Errors
    ///
    /// Returns the reason when no matching pod is co-located.
    pub fn affinity(&self, pod: &Pod, host: &str, zones: &BTreeSet<String>) -> Result<BTreeSet<String>, String> {
        let mut allowed = zones.clone();
        for term in &pod.pod_affinity {
            let matching: Vec<&PlacedPod> = self
                .placed
                .iter()
                .filter(|p| term.selects(&pod.namespace, &p.namespace, &p.labels))
                .collect();
            // The first pod of a self-selecting group may go anywhere.
            if matching.is_empty() && term.selects(&pod.namespace, &pod.namespace, &pod.labels) {
                continue;
            }
            if term.topology_key == LABEL_HOSTNAME {
                if !matching.iter().any(|p| p.host == host) {
                    return Err("pod affinity not satisfied on host".to_string());
                }
            } else if term.topology_key == LABEL_ZONE {
                let with: BTreeSet<&str> = matching.iter().filter_map(|p| p.zone.as_deref()).collect();
                allowed.retain(|z| with.contains(z.as_str()));
                if allowed.is_empty() {
                    return Err("pod affinity not satisfied in any zone".to_string());
                }
            }
        }
        Ok(allowed)
    }

    /// Zones among `zones` where neither `pod`'s anti-affinity nor that of an
    /// already placed pod is violated on `host`.
    ///
    /// # Errors
    ///
    /// Returns the reason when the host or every zone is excluded.
    pub fn anti_affinity(&self, pod: &Pod, host: &str, zones: &BTreeSet<String>) -> Result<BTreeSet<String>, String> {
        let mut allowed = zones.clone();
        for p in &self.placed {
            let ours = pod
                .pod_anti_affinity
                .iter()
                .filter(|t| t.selects(&pod.namespace, &p.namespace, &p.labels));
            let theirs = p
                .anti_affinity
                .iter()
                .filter(|t| t.selects(&p.namespace, &pod.namespace, &pod.labels));
            for term in ours.chain(theirs) {
                if term.topology_key == LABEL_HOSTNAME && p.host == host {
                    return Err("pod anti-affinity violated on host".to_string());
                }
                if term.topology_key == LABEL_ZONE {
                    if let Some(z) = &p.zone {
                        allowed.remove(z);
                    }
                }
            }
        }
        if allowed.is_empty() && !zones.is_empty() {
            return Err("pod anti-affinity excludes every zone".to_string());
        }
        Ok(allowed)
    }

    /// All three checks combined.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn allowed_zones(&self, pod: &Pod, host: &str, zones: &BTreeSet<String>) -> Result<BTreeSet<String>, String> {
        let zones = self.spread(pod, host, zones)?;
        let zones = self.affinity(pod, host, &zones)?;
        self.anti_affinity(pod, host, &zones)
    }

    fn zone_counts(&self, selects: impl Fn(&PlacedPod) -> bool) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for p in self.placed.iter().filter(|p| selects(*p)) {
            if let Some(z) = p.zone.as_deref() {
                *counts.entry(z).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Known zones the pod's node constraints permit.
    fn eligible_zones(&self, pod: &Pod) -> BTreeSet<String> {
        let alternatives = pod.scheduling_requirements();
        self.zones
            .iter()
            .filter(|z| {
                alternatives
                    .iter()
                    .any(|alt| alt.get(LABEL_ZONE).is_none_or(|r| r.has(z)))
            })
            .cloned()
            .collect()
    }
}
