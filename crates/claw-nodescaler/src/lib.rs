//! Node lifecycle controller for Kubernetes-style clusters.
//!
//! `claw-nodescaler` turns the decisions of [`claw_provisioning`] into
//! machines. It launches capacity for pods that cannot be scheduled, follows
//! each launched node through registration and initialization, removes or
//! replaces nodes that are empty, underutilized, drifted or expired, and
//! drains nodes the provider is about to reclaim.
//!
//! # Features
//!
//! - **NodeClaims**: one record per requested machine, moved through a
//!   checked lifecycle state machine
//! - **Provisioning**: pending pods simulated onto existing and new capacity
//! - **Disruption**: emptiness, consolidation, drift and expiration, within
//!   per-pool budgets and pod disruption budgets
//! - **Interruption**: forced drains bounded by the provider's notice window
//! - **Work queues**: deduplicating per-key queues served by a bounded worker
//!   pool with retry and backoff
//! - **Leader gating**: standby replicas run nothing
//!
//! # Example
//!
//! ```rust
//! use claw_nodescaler::{Controller, ControllerConfig, Scenario};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> claw_nodescaler::Result<()> {
//! let scenario = Scenario::from_json(r#"{
//!     "nodepools": [{ "name": "default" }],
//!     "instance_types": [{
//!         "name": "medium",
//!         "capacity": { "cpu_millis": 4000, "memory_bytes": 17179869184, "pods": 110 },
//!         "offerings": [{ "zone": "zone-a", "capacity_type": "on-demand", "price": 0.1 }]
//!     }],
//!     "pods": [{ "name": "web", "requests": { "cpu_millis": 500 } }]
//! }"#)?;
//! let (provider, cluster, store) = scenario.build()?;
//!
//! let controller = Controller::new(
//!     provider,
//!     cluster,
//!     store,
//!     ControllerConfig::default(),
//!     CancellationToken::new(),
//! );
//! let outcome = controller.provisioning_pass().await?;
//! assert_eq!(outcome.claims.len(), 1);
//! # Ok(())
//! # }
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

pub mod backoff;
pub mod claim_controller;
pub mod cluster;
pub mod config;
pub mod context;
pub mod controller;
pub mod disruption;
pub mod error;
pub mod interruption;
pub mod lifecycle;
pub mod locks;
pub mod provider;
pub mod provisioner;
pub mod queue;
pub mod scenario;
pub mod termination;

// Re-export main types
pub use backoff::Backoff;
pub use claim_controller::ClaimReconciler;
pub use cluster::{
    ClusterClient, EvictionOutcome, InMemoryCluster, NodePoolStatus, PodDisruptionBudget,
    Unschedulable,
};
pub use config::{
    BackoffConfig, ControllerConfig, DisruptionConfig, LifecycleConfig, ProvisioningConfig,
    SchedulingConfig,
};
pub use context::ReconcileContext;
pub use controller::{Controller, DisruptionPass};
pub use disruption::{
    BlockReason, Blocked, BudgetTracker, Candidate, Command, CommandId, CommandPhase,
    CommandTarget, Deferred, DisruptionPlan, Orchestrator, Planner, Rejected,
};
pub use error::{ControllerError, ProviderError, Result};
pub use interruption::{IgnoreReason, InterruptionHandler, InterruptionOutcome};
pub use lifecycle::{
    ClaimId, ClaimOffering, ClaimPhase, Condition, ConditionKind, NodeClaim, NodeClaimStore,
};
pub use locks::{KeyGuard, KeyLocks};
pub use provider::{
    CloudProvider, InMemoryProvider, Instance, InstanceState, InterruptionEvent,
    InterruptionKind, LaunchRequest, ProviderResult,
};
pub use provisioner::{Provisioner, ProvisioningOutcome};
pub use queue::{ReconcileOutcome, Reconciler, WorkQueue, WorkerPool};
pub use scenario::{KubeStep, Scenario, simulate_kube};
pub use termination::Terminator;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cluster::{ClusterClient, InMemoryCluster};
    pub use crate::config::ControllerConfig;
    pub use crate::controller::Controller;
    pub use crate::disruption::{Command, DisruptionPlan, Planner};
    pub use crate::error::{ControllerError, ProviderError, Result};
    pub use crate::lifecycle::{ClaimId, ClaimPhase, NodeClaim, NodeClaimStore};
    pub use crate::provider::{CloudProvider, InMemoryProvider, InterruptionKind};
    pub use crate::scenario::Scenario;
}
