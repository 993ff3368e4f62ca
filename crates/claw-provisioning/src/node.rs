//! Live cluster nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::requirements::{LABEL_HOSTNAME, LABEL_NODEPOOL, LABEL_ZONE, Requirements};
use crate::resources::Resources;
use crate::taints::{TAINT_DISRUPTED, Taint};

const fn default_ready() -> bool {
    true
}

/// A node as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node name.
    pub name: String,
    /// Provider instance ID, once the kubelet has reported it.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Node labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Node taints.
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Raw capacity.
    #[serde(default)]
    pub capacity: Resources,
    /// Capacity available to pods.
    #[serde(default)]
    pub allocatable: Resources,
    /// Ready condition.
    #[serde(default = "default_ready")]
    pub ready: bool,
    /// Cordoned.
    #[serde(default)]
    pub unschedulable: bool,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Creates a ready node with no capacity.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_HOSTNAME.to_string(), name.clone());
        Self {
            name,
            provider_id: None,
            labels,
            taints: Vec::new(),
            capacity: Resources::new(),
            allocatable: Resources::new(),
            ready: true,
            unschedulable: false,
            created_at: Utc::now(),
        }
    }

    /// Sets the provider instance ID.
    #[must_use]
    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds a taint.
    #[must_use]
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }

    /// Sets both capacity and allocatable.
    #[must_use]
    pub fn with_allocatable(mut self, allocatable: Resources) -> Self {
        self.capacity = allocatable;
        self.allocatable = allocatable;
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Sets readiness.
    #[must_use]
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// The node's labels as requirements, for compatibility checks.
    #[must_use]
    pub fn requirements(&self) -> Requirements {
        Requirements::from_labels(&self.labels)
    }

    /// The NodePool that launched this node, if any.
    #[must_use]
    pub fn nodepool(&self) -> Option<&str> {
        self.labels.get(LABEL_NODEPOOL).map(String::as_str)
    }

    /// The node's zone label.
    #[must_use]
    pub fn zone(&self) -> Option<&str> {
        self.labels.get(LABEL_ZONE).map(String::as_str)
    }

    /// Returns true if the controller has marked the node for disruption.
    #[must_use]
    pub fn is_disrupted(&self) -> bool {
        self.taints.iter().any(|t| t.key == TAINT_DISRUPTED)
    }

    /// Returns true if new pods may be simulated onto this node.
    #[must_use]
    pub fn accepts_pods(&self) -> bool {
        !self.unschedulable && !self.is_disrupted()
    }
}
