//! Error types for the scheduling model.

use thiserror::Error;

/// Result type for scheduling-model operations.
pub type Result<T> = std::result::Result<T, SchedulingError>;

/// Errors raised while building or validating scheduling inputs.
///
/// These are input errors. Pods that cannot be placed are not errors; they are
/// reported through [`crate::UnschedulableReason`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// A label requirement could not be constructed.
    #[error("invalid requirement on {key}: {reason}")]
    InvalidRequirement {
        /// Label key of the offending requirement.
        key: String,
        /// Description of why the requirement is invalid.
        reason: String,
    },

    /// A node pool definition is malformed.
    #[error("invalid node pool {name}: {reason}")]
    InvalidNodePool {
        /// Name of the node pool.
        name: String,
        /// Description of why the pool is invalid.
        reason: String,
    },

    /// A disruption budget string could not be parsed.
    #[error("invalid disruption budget '{value}': {reason}")]
    InvalidBudget {
        /// The raw budget value.
        value: String,
        /// Description of why the budget is invalid.
        reason: String,
    },

    /// An instance type definition is malformed.
    #[error("invalid instance type {name}: {reason}")]
    InvalidInstanceType {
        /// Name of the instance type.
        name: String,
        /// Description of why the instance type is invalid.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_requirement() {
        let err = SchedulingError::InvalidRequirement {
            key: "kubernetes.io/arch".into(),
            reason: "In requires at least one value".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid requirement on kubernetes.io/arch: In requires at least one value"
        );
    }

    #[test]
    fn error_display_invalid_budget() {
        let err = SchedulingError::InvalidBudget {
            value: "150%".into(),
            reason: "percentage must be between 0 and 100".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid disruption budget '150%': percentage must be between 0 and 100"
        );
    }

    #[test]
    fn error_clone_and_eq() {
        let err1 = SchedulingError::InvalidNodePool {
            name: "default".into(),
            reason: "weight out of range".into(),
        };
        assert_eq!(err1.clone(), err1);
    }
}
