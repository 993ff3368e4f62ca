//! Taints and tolerations.

use serde::{Deserialize, Serialize};

/// Taint applied by the kubelet while a node is not ready.
pub const TAINT_NOT_READY: &str = "node.kubernetes.io/not-ready";
/// Taint applied by the node controller while a node is unreachable.
pub const TAINT_UNREACHABLE: &str = "node.kubernetes.io/unreachable";
/// Taint applied to cordoned nodes.
pub const TAINT_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";
/// Taint the controller places on nodes it is disrupting.
pub const TAINT_DISRUPTED: &str = "claw.dev/disrupted";

/// Effect of a taint on pods that do not tolerate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not scheduled.
    NoSchedule,
    /// Scheduler avoids the node but may still use it.
    PreferNoSchedule,
    /// New pods are not scheduled and running pods are evicted.
    NoExecute,
}

/// A node taint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Optional taint value.
    #[serde(default)]
    pub value: Option<String>,
    /// Taint effect.
    pub effect: TaintEffect,
}

impl Taint {
    /// Creates a taint without a value.
    #[must_use]
    pub fn new(key: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: None,
            effect,
        }
    }

    /// Sets the taint value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// The taint the controller places on nodes being disrupted.
    #[must_use]
    pub fn disrupted() -> Self {
        Self::new(TAINT_DISRUPTED, TaintEffect::NoSchedule)
    }

    /// Returns true if this taint keeps non-tolerating pods off the node.
    #[must_use]
    pub fn blocks_scheduling(&self) -> bool {
        self.effect != TaintEffect::PreferNoSchedule
    }

    /// Returns true for taints that come and go with node health and are
    /// ignored when simulating placement onto in-flight capacity.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.key == TAINT_NOT_READY || self.key == TAINT_UNREACHABLE
    }

    /// Returns true if `other` has the same key and effect.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.key == other.key && self.effect == other.effect
    }
}

impl std::fmt::Display for Taint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}:{:?}", self.key, v, self.effect),
            None => write!(f, "{}:{:?}", self.key, self.effect),
        }
    }
}

/// Toleration operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Key and value must match.
    #[default]
    Equal,
    /// Key must match; value is ignored.
    Exists,
}

/// A pod toleration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Toleration {
    /// Key to match; `None` with `Exists` matches every taint.
    #[serde(default)]
    pub key: Option<String>,
    /// Match operator.
    #[serde(default)]
    pub operator: TolerationOperator,
    /// Value to match for `Equal`.
    #[serde(default)]
    pub value: Option<String>,
    /// Effect to match; `None` matches all effects.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Tolerates a taint with the given key and value.
    #[must_use]
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Equal,
            value: Some(value.into()),
            effect: None,
        }
    }

    /// Tolerates any taint with the given key.
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        }
    }

    /// Tolerates every taint.
    #[must_use]
    pub fn everything() -> Self {
        Self {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        }
    }

    /// Restricts the toleration to one effect.
    #[must_use]
    pub fn with_effect(mut self, effect: TaintEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Returns true if this toleration tolerates `taint`.
    #[must_use]
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.effect.is_some_and(|e| e != taint.effect) {
            return false;
        }
        match (&self.key, self.operator) {
            (None, TolerationOperator::Exists) => true,
            (None, TolerationOperator::Equal) => false,
            (Some(k), _) if *k != taint.key => false,
            (Some(_), TolerationOperator::Exists) => true,
            (Some(_), TolerationOperator::Equal) => {
                self.value.as_deref().unwrap_or_default() == taint.value.as_deref().unwrap_or_default()
            }
        }
    }
}

/// Returns the first scheduling-blocking taint none of `tolerations` tolerates.
#[must_use]
pub fn untolerated<'a>(taints: &'a [Taint], tolerations: &[Toleration]) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|t| t.blocks_scheduling())
        .find(|t| !tolerations.iter().any(|tol| tol.tolerates(t)))
}
