//! Label requirements: the set algebra behind node selectors, node affinity,
//! NodePool constraints and instance-type capabilities.
//!
//! A [`Requirement`] describes the set of values a single label key may take.
//! [`Requirements`] is an ordered collection of them keyed by label. Nodes,
//! NodePools, instance types and pods are all reduced to `Requirements` so that
//! one compatibility check serves every combination.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulingError};

/// Availability zone label.
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
/// Instance type label.
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
/// CPU architecture label.
pub const LABEL_ARCH: &str = "kubernetes.io/arch";
/// Hostname label.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
/// Capacity type label (`on-demand` / `spot`).
pub const LABEL_CAPACITY_TYPE: &str = "claw.dev/capacity-type";
/// Owning NodePool label.
pub const LABEL_NODEPOOL: &str = "claw.dev/nodepool";

/// Requirement operators, matching the Kubernetes node selector operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Label value must be one of the listed values.
    In,
    /// Label value must not be one of the listed values (or label absent).
    NotIn,
    /// Label must be present.
    Exists,
    /// Label must be absent.
    DoesNotExist,
    /// Label value, as an integer, must be greater than the single value.
    Gt,
    /// Label value, as an integer, must be less than the single value.
    Lt,
}

/// The set of values one label key may take.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    key: String,
    /// When true, `values` lists excluded values; otherwise allowed values.
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    /// Whether a node without this label satisfies the requirement.
    undefined_allowed: bool,
}

impl Requirement {
    /// Builds a requirement from an operator and its values.
    ///
    /// # Errors
    ///
    /// Returns error if the value count does not suit the operator or a
    /// `Gt`/`Lt` value is not an integer.
    pub fn new<I, S>(key: impl Into<String>, operator: Operator, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        let invalid = |reason: &str| SchedulingError::InvalidRequirement {
            key: key.clone(),
            reason: reason.to_string(),
        };

        match operator {
            Operator::In if values.is_empty() => Err(invalid("In requires at least one value")),
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                Err(invalid("Exists and DoesNotExist take no values"))
            }
            Operator::Gt | Operator::Lt => {
                if values.len() != 1 {
                    return Err(invalid("Gt and Lt take exactly one value"));
                }
                let bound: i64 = values
                    .iter()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| invalid("Gt and Lt values must be integers"))?;
                Ok(if operator == Operator::Gt {
                    Self::gt(key, bound)
                } else {
                    Self::lt(key, bound)
                })
            }
            Operator::In => Ok(Self::in_values(key, values)),
            Operator::NotIn => Ok(Self::not_in(key, values)),
            Operator::Exists => Ok(Self::exists(key)),
            Operator::DoesNotExist => Ok(Self::does_not_exist(key)),
        }
    }

    /// `key In (values)`.
    #[must_use]
    pub fn in_values<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            complement: false,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            undefined_allowed: false,
        }
    }

    /// `key NotIn (values)`.
    #[must_use]
    pub fn not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            complement: true,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            undefined_allowed: true,
        }
    }

    /// `key Exists`.
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            complement: true,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            undefined_allowed: false,
        }
    }

    /// `key DoesNotExist`.
    #[must_use]
    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            complement: false,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            undefined_allowed: true,
        }
    }

    /// `key Gt bound`.
    #[must_use]
    pub fn gt(key: impl Into<String>, bound: i64) -> Self {
        Self {
            greater_than: Some(bound),
            ..Self::exists(key)
        }
    }

    /// `key Lt bound`.
    #[must_use]
    pub fn lt(key: impl Into<String>, bound: i64) -> Self {
        Self {
            less_than: Some(bound),
            ..Self::exists(key)
        }
    }

    /// The label key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The operator this requirement is best described by.
    #[must_use]
    pub fn operator(&self) -> Operator {
        match (self.complement, self.values.is_empty()) {
            (true, _) if self.greater_than.is_some() => Operator::Gt,
            (true, _) if self.less_than.is_some() => Operator::Lt,
            (true, true) if !self.undefined_allowed => Operator::Exists,
            (true, _) => Operator::NotIn,
            (false, true) => Operator::DoesNotExist,
            (false, false) => Operator::In,
        }
    }

    /// Allowed values when this is an `In` set; excluded values for `NotIn`.
    #[must_use]
    pub fn values(&self) -> &BTreeSet<String> {
        &self.values
    }

    /// Whether a node lacking this label satisfies the requirement.
    #[must_use]
    pub const fn allows_undefined(&self) -> bool {
        self.undefined_allowed
    }

    /// Returns the single allowed value, if the set is exactly one value.
    #[must_use]
    pub fn single_value(&self) -> Option<&str> {
        if self.complement || self.values.len() != 1 {
            return None;
        }
        self.values.iter().next().map(String::as_str)
    }

    /// Returns true if `value` is in the allowed set.
    #[must_use]
    pub fn has(&self, value: &str) -> bool {
        if !self.within_bounds(value) {
            return false;
        }
        if self.complement {
            !self.values.contains(value)
        } else {
            self.values.contains(value)
        }
    }

    /// Returns true if at least one concrete value satisfies the requirement.
    #[must_use]
    pub fn any_value_allowed(&self) -> bool {
        if let (Some(gt), Some(lt)) = (self.greater_than, self.less_than) {
            if gt.saturating_add(1) >= lt {
                return false;
            }
        }
        self.complement || !self.values.is_empty()
    }

    /// Set intersection of two requirements on the same key.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let (complement, values) = match (self.complement, other.complement) {
            (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            (true, false) => (
                false,
                other.values.difference(&self.values).cloned().collect(),
            ),
            (false, true) => (
                false,
                self.values.difference(&other.values).cloned().collect(),
            ),
            (false, false) => (
                false,
                self.values.intersection(&other.values).cloned().collect(),
            ),
        };

        let mut result = Self {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            undefined_allowed: self.undefined_allowed && other.undefined_allowed,
        };

        // A finite set absorbs its bounds.
        if !result.complement && (greater_than.is_some() || less_than.is_some()) {
            let bounded = result.clone();
            result.values.retain(|v| bounded.within_bounds(v));
            result.greater_than = None;
            result.less_than = None;
        }
        result
    }

    /// Returns true if a node carrying `other` can satisfy `self`.
    #[must_use]
    pub fn compatible(&self, other: &Self) -> bool {
        self.intersect(other).any_value_allowed() || (self.undefined_allowed && other.undefined_allowed)
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(n) = value.parse::<i64>() else {
            return false;
        };
        self.greater_than.is_none_or(|gt| n > gt) && self.less_than.is_none_or(|lt| n < lt)
    }

    fn to_specs(&self) -> Vec<RequirementSpec> {
        let spec = |operator, values: Vec<String>| RequirementSpec {
            key: self.key.clone(),
            operator,
            values,
        };
        let mut specs = Vec::new();
        if !self.complement {
            let op = if self.values.is_empty() {
                Operator::DoesNotExist
            } else {
                Operator::In
            };
            specs.push(spec(op, self.values.iter().cloned().collect()));
            return specs;
        }
        if !self.values.is_empty() || self.undefined_allowed {
            specs.push(spec(Operator::NotIn, self.values.iter().cloned().collect()));
        }
        if !self.undefined_allowed && self.greater_than.is_none() && self.less_than.is_none() {
            specs.push(spec(Operator::Exists, Vec::new()));
        }
        if let Some(gt) = self.greater_than {
            specs.push(spec(Operator::Gt, vec![gt.to_string()]));
        }
        if let Some(lt) = self.less_than {
            specs.push(spec(Operator::Lt, vec![lt.to_string()]));
        }
        specs
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values: Vec<&str> = self.values.iter().map(String::as_str).collect();
        match self.operator() {
            Operator::Exists | Operator::DoesNotExist => {
                write!(f, "{} {:?}", self.key, self.operator())
            }
            Operator::Gt => write!(f, "{} Gt {}", self.key, self.greater_than.unwrap_or_default()),
            Operator::Lt => write!(f, "{} Lt {}", self.key, self.less_than.unwrap_or_default()),
            op => write!(f, "{} {:?} [{}]", self.key, op, values.join(",")),
        }
    }
}

/// Wire form of a requirement, as written in NodePool and pod specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    /// Label key.
    pub key: String,
    /// Operator.
    pub operator: Operator,
    /// Operand values.
    #[serde(default)]
    pub values: Vec<String>,
}

/// A conjunction of label requirements, at most one per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<RequirementSpec>", into = "Vec<RequirementSpec>")]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    /// Creates an empty (unconstrained) requirement set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One `In` requirement per label.
    #[must_use]
    pub fn from_labels<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut reqs = Self::new();
        for (k, v) in labels {
            reqs.add(Requirement::in_values(k.clone(), [v.clone()]));
        }
        reqs
    }

    /// Adds a requirement, intersecting with any existing one on the same key.
    pub fn add(&mut self, requirement: Requirement) {
        match self.0.get_mut(&requirement.key) {
            Some(existing) => *existing = existing.intersect(&requirement),
            None => {
                self.0.insert(requirement.key.clone(), requirement);
            }
        }
    }

    /// Builder form of [`Self::add`].
    #[must_use]
    pub fn with(mut self, requirement: Requirement) -> Self {
        self.add(requirement);
        self
    }

    /// Looks up the requirement for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    /// Iterates requirements in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    /// Returns true if there are no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key-wise intersection.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for req in other.iter() {
            out.add(req.clone());
        }
        out
    }

    /// Describes the first key on which `required` cannot be satisfied by a
    /// node described by `self`, or `None` if compatible.
    ///
    /// Keys `self` does not define are treated as absent labels: they only
    /// satisfy requirements that allow the label to be undefined.
    #[must_use]
    pub fn conflict(&self, required: &Self) -> Option<String> {
        for req in required.iter() {
            match self.get(req.key()) {
                Some(have) if !have.compatible(req) => {
                    return Some(format!("{req} conflicts with {have}"));
                }
                None if !req.allows_undefined() => {
                    return Some(format!("{req} requires an undefined label"));
                }
                _ => {}
            }
        }
        None
    }

    /// Like [`Self::conflict`], but only keys both sides define are checked.
    #[must_use]
    pub fn shared_conflict(&self, other: &Self) -> Option<String> {
        other.iter().find_map(|req| {
            self.get(req.key())
                .filter(|have| !have.compatible(req))
                .map(|have| format!("{req} conflicts with {have}"))
        })
    }

    /// Returns true if a node described by `self` can satisfy `required`.
    #[must_use]
    pub fn compatible(&self, required: &Self) -> bool {
        self.conflict(required).is_none()
    }

    /// Returns true if a concrete label set satisfies every requirement.
    #[must_use]
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.iter().all(|req| match labels.get(req.key()) {
            Some(value) => req.has(value),
            None => req.allows_undefined(),
        })
    }

    /// Labels for every key constrained to exactly one value.
    #[must_use]
    pub fn single_valued_labels(&self) -> BTreeMap<String, String> {
        self.iter()
            .filter_map(|r| r.single_value().map(|v| (r.key.clone(), v.to_string())))
            .collect()
    }
}

impl TryFrom<Vec<RequirementSpec>> for Requirements {
    type Error = SchedulingError;

    fn try_from(specs: Vec<RequirementSpec>) -> Result<Self> {
        let mut reqs = Self::new();
        for spec in specs {
            reqs.add(Requirement::new(spec.key, spec.operator, spec.values)?);
        }
        Ok(reqs)
    }
}

impl From<Requirements> for Vec<RequirementSpec> {
    fn from(reqs: Requirements) -> Self {
        reqs.iter().flat_map(Requirement::to_specs).collect()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut reqs = Self::new();
        for r in iter {
            reqs.add(r);
        }
        reqs
    }
}
