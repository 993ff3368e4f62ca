//! Instance types, their priced offerings, and the per-pass catalog.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulingError};
use crate::nodepool::NodePool;
use crate::requirements::{
    LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE, Requirement, Requirements,
};
use crate::resources::Resources;

/// Purchase model of an offering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapacityType {
    /// Regular on-demand capacity.
    #[serde(rename = "on-demand")]
    OnDemand,
    /// Interruptible spot capacity.
    #[serde(rename = "spot")]
    Spot,
}

impl CapacityType {
    /// Label value for this capacity type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Spot => "spot",
        }
    }
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How capacity types are weighed against price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityPreference {
    /// Cheapest wins; on-demand breaks exact ties.
    #[default]
    LowestPrice,
    /// On-demand whenever an on-demand offering is compatible.
    PreferOnDemand,
    /// Spot whenever a spot offering is compatible.
    PreferSpot,
}

impl CapacityPreference {
    /// Rank used before price: lower ranks are always chosen first.
    #[must_use]
    pub const fn rank(self, capacity_type: CapacityType) -> u8 {
        match (self, capacity_type) {
            (Self::PreferOnDemand, CapacityType::Spot)
            | (Self::PreferSpot, CapacityType::OnDemand) => 1,
            _ => 0,
        }
    }

    /// Rank used after price and headroom.
    #[must_use]
    pub const fn tie_rank(self, capacity_type: CapacityType) -> u8 {
        match (self, capacity_type) {
            (Self::PreferSpot, CapacityType::Spot) => 0,
            (Self::PreferSpot, CapacityType::OnDemand) => 1,
            (_, CapacityType::OnDemand) => 0,
            (_, CapacityType::Spot) => 1,
        }
    }
}

/// Pod slots assumed when an instance type does not report any.
pub const DEFAULT_MAX_PODS: u32 = 110;

const fn default_available() -> u32 {
    1
}

/// One priced way to buy an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    /// Instance type name; filled in by the owning [`InstanceType`].
    #[serde(default)]
    pub instance_type: String,
    /// Availability zone.
    pub zone: String,
    /// Capacity type.
    pub capacity_type: CapacityType,
    /// Hourly price.
    pub price: f64,
    /// Capacity hint; zero means currently unavailable.
    #[serde(default = "default_available")]
    pub available: u32,
}

impl Offering {
    /// Returns true if the provider reports capacity.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.available > 0
    }

    /// Returns true if the zone and capacity type satisfy `reqs`.
    #[must_use]
    pub fn satisfies(&self, reqs: &Requirements) -> bool {
        reqs.get(LABEL_ZONE).is_none_or(|r| r.has(&self.zone))
            && reqs
                .get(LABEL_CAPACITY_TYPE)
                .is_none_or(|r| r.has(self.capacity_type.as_str()))
    }

    /// Total order used to pick an offering: preference rank, price, tie rank,
    /// zone, instance type.
    #[must_use]
    pub fn cmp_for(&self, other: &Self, preference: CapacityPreference) -> Ordering {
        preference
            .rank(self.capacity_type)
            .cmp(&preference.rank(other.capacity_type))
            .then_with(|| self.price.total_cmp(&other.price))
            .then_with(|| {
                preference
                    .tie_rank(self.capacity_type)
                    .cmp(&preference.tie_rank(other.capacity_type))
            })
            .then_with(|| self.zone.cmp(&other.zone))
            .then_with(|| self.instance_type.cmp(&other.instance_type))
    }
}

/// A launchable machine shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Instance type name.
    pub name: String,
    /// Machine capacity.
    pub capacity: Resources,
    /// Capacity reserved for the system and kubelet.
    #[serde(default)]
    pub overhead: Resources,
    /// Well-known labels the instance carries (arch, gpu model, ...).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Priced offerings.
    #[serde(default)]
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Creates an instance type without offerings.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: Resources) -> Self {
        Self {
            name: name.into(),
            capacity,
            overhead: Resources::new(),
            labels: BTreeMap::new(),
            offerings: Vec::new(),
        }
    }

    /// Sets system overhead.
    #[must_use]
    pub fn with_overhead(mut self, overhead: Resources) -> Self {
        self.overhead = overhead;
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an available offering.
    #[must_use]
    pub fn with_offering(
        mut self,
        zone: impl Into<String>,
        capacity_type: CapacityType,
        price: f64,
    ) -> Self {
        self.offerings.push(Offering {
            instance_type: self.name.clone(),
            zone: zone.into(),
            capacity_type,
            price,
            available: 1,
        });
        self
    }

    /// Ensures every offering names this instance type.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for o in &mut self.offerings {
            o.instance_type.clone_from(&self.name);
        }
        self
    }

    /// Checks prices and capacity are sane.
    ///
    /// # Errors
    ///
    /// Returns error on a negative or non-finite price, or overhead above capacity.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| SchedulingError::InvalidInstanceType {
            name: self.name.clone(),
            reason,
        };
        if !self.overhead.fits_in(&self.capacity) {
            return Err(invalid("overhead exceeds capacity".to_string()));
        }
        if let Some(o) = self
            .offerings
            .iter()
            .find(|o| !o.price.is_finite() || o.price < 0.0)
        {
            return Err(invalid(format!("invalid price {} in {}", o.price, o.zone)));
        }
        Ok(())
    }

    /// Capacity left for pods, with the pod slot count optionally overridden.
    /// Types that report no pod slots get the kubelet default.
    #[must_use]
    pub fn allocatable(&self, max_pods: Option<u32>) -> Resources {
        let alloc = self.capacity.saturating_sub(&self.overhead);
        match max_pods {
            Some(n) => alloc.with_pods(n),
            None if self.capacity.pods == 0 => alloc.with_pods(DEFAULT_MAX_PODS),
            None => alloc,
        }
    }

    /// Offerings the provider currently reports capacity for.
    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|o| o.is_available())
    }

    /// Requirements describing any node of this type: its labels, its name,
    /// and the zones and capacity types it can currently be bought in.
    #[must_use]
    pub fn requirements(&self) -> Requirements {
        let mut reqs = Requirements::from_labels(&self.labels);
        reqs.add(Requirement::in_values(LABEL_INSTANCE_TYPE, [self.name.clone()]));
        reqs.add(Requirement::in_values(
            LABEL_ZONE,
            self.available_offerings().map(|o| o.zone.clone()),
        ));
        reqs.add(Requirement::in_values(
            LABEL_CAPACITY_TYPE,
            self.available_offerings().map(|o| o.capacity_type.as_str()),
        ));
        reqs
    }

    /// Available offerings whose zone and capacity type satisfy `reqs`.
    pub fn compatible_offerings<'a>(
        &'a self,
        reqs: &'a Requirements,
    ) -> impl Iterator<Item = &'a Offering> + 'a {
        self.available_offerings().filter(move |o| o.satisfies(reqs))
    }

    /// Best compatible offering under `preference`.
    #[must_use]
    pub fn best_offering(
        &self,
        reqs: &Requirements,
        preference: CapacityPreference,
    ) -> Option<&Offering> {
        self.available_offerings()
            .filter(|o| o.satisfies(reqs))
            .min_by(|a, b| a.cmp_for(b, preference))
    }
}

/// Instance types per NodePool, frozen for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct OfferingCatalog {
    pools: BTreeMap<String, Arc<[InstanceType]>>,
}

impl OfferingCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the instance types the provider offers for `pool`, keeping only
    /// those compatible with the pool's requirements and currently available.
    pub fn insert(&mut self, pool: &NodePool, types: Vec<InstanceType>) {
        let mut kept: Vec<InstanceType> = types
            .into_iter()
            .map(InstanceType::normalized)
            .filter(|it| it.validate().is_ok())
            .filter(|it| it.available_offerings().next().is_some())
            .filter(|it| it.requirements().shared_conflict(&pool.requirements).is_none())
            .collect();
        kept.sort_by(|a, b| a.name.cmp(&b.name));
        self.pools.insert(pool.name.clone(), kept.into());
    }

    /// Builder form of [`Self::insert`].
    #[must_use]
    pub fn with_pool(mut self, pool: &NodePool, types: Vec<InstanceType>) -> Self {
        self.insert(pool, types);
        self
    }

    /// Instance types usable by `pool`, sorted by name.
    #[must_use]
    pub fn instance_types_for(&self, pool: &str) -> &[InstanceType] {
        self.pools.get(pool).map(|types| &types[..]).unwrap_or_default()
    }

    /// Looks up an instance type by name within a pool.
    #[must_use]
    pub fn instance_type(&self, pool: &str, name: &str) -> Option<&InstanceType> {
        self.instance_types_for(pool).iter().find(|it| it.name == name)
    }

    /// Returns true if no pool has any instance type.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.values().all(|types| types.is_empty())
    }
}
