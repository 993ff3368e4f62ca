//! Error types for the node controller.

use claw_provisioning::SchedulingError;
use thiserror::Error;

use crate::lifecycle::{ClaimId, ClaimPhase};

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Failures reported by the cloud provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling, network failure or another condition worth retrying.
    #[error("transient provider error: {reason}")]
    Transient {
        /// What went wrong.
        reason: String,
    },

    /// The offering has no capacity left.
    #[error("insufficient capacity for {instance_type} in {zone}")]
    InsufficientCapacity {
        /// Requested instance type.
        instance_type: String,
        /// Requested zone.
        zone: String,
    },

    /// The instance does not exist.
    #[error("instance not found: {provider_id}")]
    NotFound {
        /// Provider instance ID.
        provider_id: String,
    },

    /// The provider refused the request.
    #[error("request rejected: {reason}")]
    Rejected {
        /// Why it was refused.
        reason: String,
    },
}

impl ProviderError {
    /// Returns true for errors that may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors that can occur while reconciling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// A provider call failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The cluster API failed.
    #[error("cluster api error: {reason}")]
    Cluster {
        /// What went wrong.
        reason: String,
    },

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {after_secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Budget that was exceeded.
        after_secs: u64,
    },

    /// The caller's deadline passed or shutdown was requested.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation name.
        operation: String,
    },

    /// No claim has this ID.
    #[error("node claim not found: {claim_id}")]
    ClaimNotFound {
        /// The missing claim.
        claim_id: ClaimId,
    },

    /// The lifecycle does not allow this transition.
    #[error("claim {claim_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// The claim.
        claim_id: ClaimId,
        /// Current phase.
        from: ClaimPhase,
        /// Requested phase.
        to: ClaimPhase,
    },

    /// Another claim already holds this provider instance.
    #[error("provider instance {provider_id} already bound to claim {existing}")]
    DuplicateProviderId {
        /// Provider instance ID.
        provider_id: String,
        /// Claim that holds it.
        existing: ClaimId,
    },

    /// A claim references a NodePool that no longer exists.
    #[error("nodepool not found: {name}")]
    NodePoolNotFound {
        /// Pool name.
        name: String,
    },

    /// A pool no longer offers an instance type a decision relied on.
    #[error("instance type {instance_type} not offered to nodepool {nodepool}")]
    InstanceTypeNotFound {
        /// Pool name.
        nodepool: String,
        /// Instance type name.
        instance_type: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// Invalid scheduling input.
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// Another worker holds the key.
    #[error("lock contended: {key}")]
    LockContended {
        /// The contended key.
        key: String,
    },
}

impl ControllerError {
    /// Returns true for transient collaborator failures that should be
    /// retried with backoff without changing lifecycle state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Cluster { .. } | Self::Timeout { .. } | Self::LockContended { .. } => true,
            _ => false,
        }
    }

    /// Shorthand for a cluster API error.
    pub fn cluster(reason: impl Into<String>) -> Self {
        Self::Cluster {
            reason: reason.into(),
        }
    }
}
