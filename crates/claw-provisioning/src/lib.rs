//! Offline scheduling simulation for node autoscaling.
//!
//! `claw-provisioning` answers one question: given pods that cannot be
//! scheduled, the nodes that already exist and the compute the provider can
//! sell, which nodes should be launched? It reproduces the Kubernetes
//! placement rules that matter for that decision and bin-packs pods onto the
//! cheapest capacity that satisfies them.
//!
//! Everything here is synchronous and free of I/O, so the same simulation can
//! be run for provisioning and again, unchanged, to validate a disruption.
//!
//! # Features
//!
//! - **Label requirements**: `In`, `NotIn`, `Exists`, `DoesNotExist`, `Gt`, `Lt`
//!   with set intersection and compatibility checks
//! - **Taints and tolerations** with Kubernetes matching rules
//! - **Topology**: hostname and zone spread, pod affinity and anti-affinity
//! - **Offering catalog**: instance types priced per zone and capacity type
//! - **Simulator**: best-fit-decreasing placement with NodePool limits and
//!   daemonset overhead
//!
//! # Example
//!
//! ```rust
//! use claw_provisioning::{
//!     simulate, CapacityType, ClusterState, InstanceType, NodePool, OfferingCatalog, Pod,
//!     Resources,
//! };
//!
//! let pool = NodePool::new("default");
//! let large = InstanceType::new("large", Resources::new().with_cpu(8))
//!     .with_offering("zone-a", CapacityType::OnDemand, 0.15);
//! let catalog = OfferingCatalog::new().with_pool(&pool, vec![large]);
//!
//! let pods: Vec<Pod> = (0..3)
//!     .map(|i| Pod::new("default", format!("web-{i}")).with_requests(Resources::new().with_cpu(2)))
//!     .collect();
//!
//! let results = simulate(&pods, &ClusterState::default(), &catalog, &[pool]);
//! assert!(results.all_scheduled());
//! assert_eq!(results.node_claims.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod error;
pub mod node;
pub mod nodepool;
pub mod offering;
pub mod pod;
pub mod predicates;
pub mod requirements;
pub mod resources;
pub mod scheduler;
pub mod snapshot;
pub mod taints;
pub mod topology;

// Re-export main types
pub use error::{Result, SchedulingError};
pub use node::Node;
pub use nodepool::{
    Budget, BudgetRounding, BudgetValue, ConsolidationPolicy, DisruptionMethod, DisruptionPolicy,
    KubeletConfig, NodePool, NodeTemplate,
};
pub use offering::{CapacityPreference, CapacityType, InstanceType, Offering, OfferingCatalog};
pub use pod::{
    LabelSelector, OwnerRef, Pod, PodAffinityTerm, PodKey, PodPhase, TopologySpreadConstraint,
    WhenUnsatisfiable,
};
pub use predicates::{NodeView, Predicate};
pub use requirements::{Operator, Requirement, Requirements};
pub use resources::Resources;
pub use scheduler::{
    NodeClaimTemplate, Placement, PlacementTarget, SchedulingPolicy, SchedulingResults,
    UnschedulableReason, simulate, simulate_with,
};
pub use snapshot::{ClusterState, StateNode};
pub use taints::{Taint, TaintEffect, Toleration, TolerationOperator};
pub use topology::Topology;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Result, SchedulingError};
    pub use crate::node::Node;
    pub use crate::nodepool::{DisruptionMethod, NodePool};
    pub use crate::offering::{CapacityType, InstanceType, OfferingCatalog};
    pub use crate::pod::{Pod, PodKey};
    pub use crate::requirements::{Requirement, Requirements};
    pub use crate::resources::Resources;
    pub use crate::scheduler::{SchedulingResults, UnschedulableReason, simulate};
    pub use crate::snapshot::ClusterState;
    pub use crate::taints::{Taint, TaintEffect, Toleration};
}
