//! Controller configuration.
//!
//! Configuration for the node controller, including:
//! - Worker pool size and pass time budget
//! - Provisioning and disruption intervals
//! - Claim registration deadlines
//! - Provider call retry policy
//! - Scheduling policy
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use claw_provisioning::{BudgetRounding, CapacityPreference, DisruptionMethod, SchedulingPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Provisioning loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Seconds between provisioning passes.
    pub interval_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

/// NodeClaim lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long a launched instance may take to register as a node.
    pub registration_timeout_secs: u64,
    /// How often a claim waiting on the cluster is re-checked.
    pub poll_interval_secs: u64,
    /// How long terminal claims are kept before being pruned.
    pub terminal_retention_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            registration_timeout_secs: 900,
            poll_interval_secs: 5,
            terminal_retention_secs: 3600,
        }
    }
}

impl LifecycleConfig {
    /// Registration deadline as a duration.
    #[must_use]
    pub const fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Disruption loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisruptionConfig {
    /// Whether voluntary disruption runs at all.
    pub enabled: bool,
    /// Seconds between disruption passes.
    pub interval_secs: u64,
    /// How long a drain may take before the command is aborted.
    pub drain_timeout_secs: u64,
    /// Upper bound on nodes considered together for multi-node consolidation.
    pub max_multi_node_candidates: usize,
    /// Rounding applied to percentage budgets.
    pub budget_rounding: BudgetRounding,
    /// Voluntary methods that may run.
    pub methods: Vec<DisruptionMethod>,
}

impl Default for DisruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            drain_timeout_secs: 600,
            max_multi_node_candidates: 100,
            budget_rounding: BudgetRounding::Up,
            methods: DisruptionMethod::VOLUNTARY.to_vec(),
        }
    }
}

impl DisruptionConfig {
    /// Returns true if `method` is enabled.
    #[must_use]
    pub fn allows(&self, method: DisruptionMethod) -> bool {
        self.enabled && self.methods.contains(&method)
    }

    /// Drain timeout as a duration.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Retry policy for provider and cluster calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay_secs: u64,
    /// Upper bound on the delay between retries.
    pub max_delay_secs: u64,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Fraction of the delay randomised in either direction.
    pub jitter: f64,
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Timeout applied to every individual call.
    pub call_timeout_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 1,
            max_delay_secs: 60,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 5,
            call_timeout_secs: 30,
        }
    }
}

/// Simulator policy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// How on-demand and spot capacity are weighed against price.
    pub capacity_preference: CapacityPreference,
}

impl SchedulingConfig {
    /// The simulator policy.
    #[must_use]
    pub const fn policy(&self) -> SchedulingPolicy {
        SchedulingPolicy {
            capacity_preference: self.capacity_preference,
        }
    }
}

/// Main controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reconcile workers per queue.
    pub workers: usize,
    /// Time budget of one provisioning or disruption pass.
    pub pass_timeout_secs: u64,
    /// Provisioning settings.
    pub provisioning: ProvisioningConfig,
    /// Lifecycle settings.
    pub lifecycle: LifecycleConfig,
    /// Disruption settings.
    pub disruption: DisruptionConfig,
    /// Retry settings.
    pub backoff: BackoffConfig,
    /// Scheduling settings.
    pub scheduling: SchedulingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pass_timeout_secs: 60,
            provisioning: ProvisioningConfig::default(),
            lifecycle: LifecycleConfig::default(),
            disruption: DisruptionConfig::default(),
            backoff: BackoffConfig::default(),
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ControllerError::Config {
            reason: format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ),
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ControllerError::Config {
            reason: format!("invalid TOML: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(ControllerError::Config {
                reason: reason.to_string(),
            })
        };

        if self.workers == 0 {
            return invalid("workers must be greater than 0");
        }
        if self.pass_timeout_secs == 0 {
            return invalid("pass_timeout_secs must be greater than 0");
        }
        if self.provisioning.interval_secs == 0 {
            return invalid("provisioning.interval_secs must be greater than 0");
        }
        if self.lifecycle.registration_timeout_secs == 0 {
            return invalid("lifecycle.registration_timeout_secs must be greater than 0");
        }
        if self.lifecycle.poll_interval_secs == 0 {
            return invalid("lifecycle.poll_interval_secs must be greater than 0");
        }
        if self.disruption.interval_secs == 0 {
            return invalid("disruption.interval_secs must be greater than 0");
        }
        if self.disruption.drain_timeout_secs == 0 {
            return invalid("disruption.drain_timeout_secs must be greater than 0");
        }
        if self.disruption.max_multi_node_candidates == 0 {
            return invalid("disruption.max_multi_node_candidates must be greater than 0");
        }
        if let Some(m) = self.disruption.methods.iter().find(|m| !m.is_voluntary()) {
            return Err(ControllerError::Config {
                reason: format!("disruption.methods: {m} is not a voluntary method"),
            });
        }
        if self.backoff.multiplier < 1.0 {
            return invalid("backoff.multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return invalid("backoff.jitter must be between 0.0 and 1.0");
        }
        if self.backoff.max_attempts == 0 {
            return invalid("backoff.max_attempts must be greater than 0");
        }
        if self.backoff.call_timeout_secs == 0 {
            return invalid("backoff.call_timeout_secs must be greater than 0");
        }
        if self.backoff.initial_delay_secs > self.backoff.max_delay_secs {
            return invalid("backoff.initial_delay_secs cannot exceed backoff.max_delay_secs");
        }

        Ok(())
    }

    /// Pass time budget as a duration.
    #[must_use]
    pub const fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }
}
