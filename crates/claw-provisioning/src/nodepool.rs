//! NodePools: operator-defined templates and policy for launchable nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulingError};
use crate::requirements::{LABEL_NODEPOOL, Requirement, Requirements};
use crate::resources::Resources;
use crate::taints::Taint;

/// Why a node is being disrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisruptionMethod {
    /// Node exceeded its NodePool's maximum age.
    Expiration,
    /// Node no longer matches its NodePool's template.
    Drift,
    /// Node holds no workload pods.
    Emptiness,
    /// Node can be removed or replaced more cheaply.
    Consolidation,
    /// Provider is reclaiming the instance.
    Interruption,
}

impl DisruptionMethod {
    /// Voluntary methods in evaluation priority order.
    pub const VOLUNTARY: [Self; 4] = [
        Self::Expiration,
        Self::Drift,
        Self::Emptiness,
        Self::Consolidation,
    ];

    /// Returns true for methods the controller chooses on its own.
    #[must_use]
    pub const fn is_voluntary(self) -> bool {
        !matches!(self, Self::Interruption)
    }
}

impl std::fmt::Display for DisruptionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Expiration => "expiration",
            Self::Drift => "drift",
            Self::Emptiness => "emptiness",
            Self::Consolidation => "consolidation",
            Self::Interruption => "interruption",
        };
        f.write_str(s)
    }
}

/// When a pool's nodes may be consolidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConsolidationPolicy {
    /// Only empty nodes are removed.
    WhenEmpty,
    /// Empty nodes are removed and underutilised nodes are consolidated.
    #[default]
    WhenEmptyOrUnderutilized,
}

/// How percentage budgets are rounded to a node count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetRounding {
    /// Round up, so any non-zero percentage allows at least one node.
    #[default]
    Up,
    /// Round down.
    Down,
}

/// A parsed budget value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetValue {
    /// Absolute node count.
    Count(u32),
    /// Percentage of the pool's nodes.
    Percent(u32),
}

impl BudgetValue {
    /// Parses `"3"` or `"10%"`.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a count or a percentage in 0..=100.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| SchedulingError::InvalidBudget {
            value: raw.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = raw.trim();
        if let Some(pct) = trimmed.strip_suffix('%') {
            let n: u32 = pct.parse().map_err(|_| invalid("not a percentage"))?;
            if n > 100 {
                return Err(invalid("percentage must be between 0 and 100"));
            }
            Ok(Self::Percent(n))
        } else {
            trimmed
                .parse()
                .map(Self::Count)
                .map_err(|_| invalid("not a node count"))
        }
    }

    /// Resolves to a node count for a pool of `total` nodes.
    #[must_use]
    pub fn resolve(self, total: usize, rounding: BudgetRounding) -> usize {
        match self {
            Self::Count(n) => n as usize,
            Self::Percent(p) => {
                let scaled = total.saturating_mul(p as usize);
                match rounding {
                    BudgetRounding::Up => scaled.div_ceil(100),
                    BudgetRounding::Down => scaled / 100,
                }
            }
        }
    }
}

/// A disruption budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum nodes disrupted at once: a count (`"3"`) or a percentage (`"10%"`).
    pub nodes: String,
    /// Methods this budget constrains; empty means all.
    #[serde(default)]
    pub reasons: Vec<DisruptionMethod>,
}

impl Budget {
    /// Creates a budget constraining every method.
    #[must_use]
    pub fn new(nodes: impl Into<String>) -> Self {
        Self {
            nodes: nodes.into(),
            reasons: Vec::new(),
        }
    }

    /// Restricts the budget to one method.
    #[must_use]
    pub fn for_reason(mut self, method: DisruptionMethod) -> Self {
        self.reasons.push(method);
        self
    }

    /// Returns true if this budget constrains `method`.
    #[must_use]
    pub fn applies_to(&self, method: DisruptionMethod) -> bool {
        self.reasons.is_empty() || self.reasons.contains(&method)
    }

    /// Parses the node value.
    ///
    /// # Errors
    ///
    /// Returns error if `nodes` is malformed.
    pub fn value(&self) -> Result<BudgetValue> {
        BudgetValue::parse(&self.nodes)
    }
}

fn default_budgets() -> Vec<Budget> {
    vec![Budget::new("10%")]
}

const fn default_consolidate_after_secs() -> u64 {
    30
}

/// Disruption policy for a pool's nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionPolicy {
    /// Which nodes are eligible for consolidation.
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,
    /// Grace period before empty or underutilised nodes are acted on.
    #[serde(default = "default_consolidate_after_secs")]
    pub consolidate_after_secs: u64,
    /// Maximum node age; `None` disables expiration.
    #[serde(default)]
    pub expire_after_secs: Option<u64>,
    /// Concurrent disruption limits.
    #[serde(default = "default_budgets")]
    pub budgets: Vec<Budget>,
}

impl Default for DisruptionPolicy {
    fn default() -> Self {
        Self {
            consolidation_policy: ConsolidationPolicy::default(),
            consolidate_after_secs: default_consolidate_after_secs(),
            expire_after_secs: None,
            budgets: default_budgets(),
        }
    }
}

/// Kubelet settings applied to launched nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KubeletConfig {
    /// Overrides the instance type's pod slot count.
    #[serde(default)]
    pub max_pods: Option<u32>,
}

/// Template applied to nodes launched for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Labels set on launched nodes.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Taints set on launched nodes.
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Taints expected to be removed by node agents during startup.
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
    /// Kubelet configuration.
    #[serde(default)]
    pub kubelet: KubeletConfig,
}

/// An operator-defined pool of launchable nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    /// Pool name.
    pub name: String,
    /// Preference on price ties; higher wins.
    #[serde(default)]
    pub weight: u32,
    /// Constraints on launchable instances.
    #[serde(default)]
    pub requirements: Requirements,
    /// Node template.
    #[serde(default)]
    pub template: NodeTemplate,
    /// Upper bound on total capacity launched for the pool.
    #[serde(default)]
    pub limits: Option<Resources>,
    /// Disruption policy.
    #[serde(default)]
    pub disruption: DisruptionPolicy,
}

impl NodePool {
    /// Creates an unconstrained pool.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 0,
            requirements: Requirements::new(),
            template: NodeTemplate::default(),
            limits: None,
            disruption: DisruptionPolicy::default(),
        }
    }

    /// Adds a requirement.
    #[must_use]
    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.add(requirement);
        self
    }

    /// Sets the weight.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Adds a template taint.
    #[must_use]
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.template.taints.push(taint);
        self
    }

    /// Sets capacity limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Resources) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Sets the disruption policy.
    #[must_use]
    pub fn with_disruption(mut self, disruption: DisruptionPolicy) -> Self {
        self.disruption = disruption;
        self
    }

    /// Validates the pool definition.
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty, the weight is above 100, or a
    /// budget is malformed.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| SchedulingError::InvalidNodePool {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.weight > 100 {
            return Err(invalid(format!("weight {} exceeds 100", self.weight)));
        }
        for budget in &self.disruption.budgets {
            budget.value()?;
        }
        Ok(())
    }

    /// Requirements every node launched by this pool satisfies: the pool's
    /// requirements, its template labels and the pool label itself.
    #[must_use]
    pub fn node_requirements(&self) -> Requirements {
        let mut reqs = self.requirements.clone();
        for (k, v) in &self.template.labels {
            reqs.add(Requirement::in_values(k.clone(), [v.clone()]));
        }
        reqs.add(Requirement::in_values(LABEL_NODEPOOL, [self.name.clone()]));
        reqs
    }

    /// All taints a launched node carries: template taints plus startup taints.
    pub fn launch_taints(&self) -> impl Iterator<Item = &Taint> {
        self.template.taints.iter().chain(&self.template.startup_taints)
    }

    /// Stable digest of the requirements and template, recorded on launched
    /// claims for drift detection.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for req in self.requirements.iter() {
            hasher.update(req.to_string().as_bytes());
            hasher.update(b"\n");
        }
        for (k, v) in &self.template.labels {
            hasher.update(format!("label {k}={v}\n").as_bytes());
        }
        for t in &self.template.taints {
            hasher.update(format!("taint {t}\n").as_bytes());
        }
        for t in &self.template.startup_taints {
            hasher.update(format!("startup {t}\n").as_bytes());
        }
        if let Some(max) = self.template.kubelet.max_pods {
            hasher.update(format!("max_pods {max}\n").as_bytes());
        }
        hasher.finalize().to_hex().as_str()[..16].to_string()
    }

    /// Nodes `method` may disrupt right now, given the pool's node count and
    /// how many are already being disrupted. The tightest applicable budget wins.
    ///
    /// # Errors
    ///
    /// Returns error if a budget is malformed.
    pub fn allowed_disruptions(
        &self,
        method: DisruptionMethod,
        total: usize,
        disrupting: usize,
        rounding: BudgetRounding,
    ) -> Result<usize> {
        let mut allowed = usize::MAX;
        for budget in self.disruption.budgets.iter().filter(|b| b.applies_to(method)) {
            allowed = allowed.min(budget.value()?.resolve(total, rounding));
        }
        if allowed == usize::MAX {
            return Ok(total.saturating_sub(disrupting));
        }
        Ok(allowed.saturating_sub(disrupting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::LABEL_ARCH;
    use crate::taints::TaintEffect;
    use test_case::test_case;

    mod budget_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("3", BudgetValue::Count(3))]
        #[test_case("10%", BudgetValue::Percent(10))]
        #[test_case(" 0% ", BudgetValue::Percent(0))]
        fn parses(raw: &str, expected: BudgetValue) {
            assert_eq!(BudgetValue::parse(raw), Ok(expected));
        }

        #[test_case("150%")]
        #[test_case("ten")]
        #[test_case("-1")]
        fn rejects(raw: &str) {
            assert!(BudgetValue::parse(raw).is_err());
        }

        #[test_case(BudgetValue::Percent(10), 5, BudgetRounding::Up, 1)]
        #[test_case(BudgetValue::Percent(10), 5, BudgetRounding::Down, 0)]
        #[test_case(BudgetValue::Percent(50), 7, BudgetRounding::Up, 4)]
        #[test_case(BudgetValue::Percent(50), 7, BudgetRounding::Down, 3)]
        #[test_case(BudgetValue::Count(2), 100, BudgetRounding::Down, 2)]
        fn resolves(value: BudgetValue, total: usize, rounding: BudgetRounding, expected: usize) {
            assert_eq!(value.resolve(total, rounding), expected);
        }

        #[test]
        fn tightest_applicable_budget_wins() {
            let pool = NodePool::new("p").with_disruption(DisruptionPolicy {
                budgets: vec![
                    Budget::new("50%"),
                    Budget::new("1").for_reason(DisruptionMethod::Drift),
                ],
                ..DisruptionPolicy::default()
            });
            let drift = pool
                .allowed_disruptions(DisruptionMethod::Drift, 10, 0, BudgetRounding::Up)
                .expect("valid");
            assert_eq!(drift, 1);
            let empty = pool
                .allowed_disruptions(DisruptionMethod::Emptiness, 10, 2, BudgetRounding::Up)
                .expect("valid");
            assert_eq!(empty, 3);
        }

        #[test]
        fn exhausted_budget_floors_at_zero() {
            let pool = NodePool::new("p");
            let allowed = pool
                .allowed_disruptions(DisruptionMethod::Consolidation, 10, 4, BudgetRounding::Up)
                .expect("valid");
            assert_eq!(allowed, 0);
        }
    }

    mod nodepool_tests {
        use super::*;

        #[test]
        fn validate_rejects_bad_weight_and_budget() {
            assert!(NodePool::new("p").validate().is_ok());
            assert!(NodePool::new("").validate().is_err());
            assert!(NodePool::new("p").with_weight(101).validate().is_err());

            let bad = NodePool::new("p").with_disruption(DisruptionPolicy {
                budgets: vec![Budget::new("x")],
                ..DisruptionPolicy::default()
            });
            assert!(matches!(
                bad.validate(),
                Err(SchedulingError::InvalidBudget { .. })
            ));
        }

        #[test]
        fn node_requirements_include_pool_label() {
            let pool = NodePool::new("gpu").with_requirement(Requirement::in_values(LABEL_ARCH, ["amd64"]));
            let reqs = pool.node_requirements();
            assert_eq!(reqs.get(LABEL_NODEPOOL).and_then(Requirement::single_value), Some("gpu"));
            assert!(reqs.get(LABEL_ARCH).is_some());
        }

        #[test]
        fn hash_tracks_template_changes() {
            let a = NodePool::new("p");
            let b = a.clone().with_weight(50);
            assert_eq!(a.hash(), b.hash());

            let c = a.clone().with_taint(Taint::new("dedicated", TaintEffect::NoSchedule));
            assert_ne!(a.hash(), c.hash());

            let d = a.clone().with_requirement(Requirement::in_values(LABEL_ARCH, ["arm64"]));
            assert_ne!(a.hash(), d.hash());
        }

        #[test]
        fn deserializes_with_defaults() {
            let pool: NodePool = serde_json::from_str(r#"{"name":"default"}"#).expect("deserialize");
            assert_eq!(pool.disruption.budgets, vec![Budget::new("10%")]);
            assert_eq!(pool.disruption.consolidate_after_secs, 30);
            assert_eq!(
                pool.disruption.consolidation_policy,
                ConsolidationPolicy::WhenEmptyOrUnderutilized
            );
        }
    }
}
