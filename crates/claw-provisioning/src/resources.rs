//! Resource quantities used for fitting pods onto nodes.

use serde::{Deserialize, Serialize};

/// Bytes in one mebibyte.
pub const MIB: u64 = 1024 * 1024;
/// Bytes in one gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// A bundle of schedulable resources.
///
/// Used for pod requests, node capacity and allocatable, NodePool limits and
/// remaining headroom alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores (1000 = 1 core).
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Number of GPUs.
    #[serde(default)]
    pub gpus: u32,
    /// Number of pod slots.
    #[serde(default)]
    pub pods: u32,
}

impl Resources {
    /// Creates an empty resource bundle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cpu_millis: 0,
            memory_bytes: 0,
            gpus: 0,
            pods: 0,
        }
    }

    /// Sets CPU in millicores.
    #[must_use]
    pub const fn with_cpu_millis(mut self, millis: u64) -> Self {
        self.cpu_millis = millis;
        self
    }

    /// Sets CPU in whole cores.
    #[must_use]
    pub const fn with_cpu(mut self, cores: u64) -> Self {
        self.cpu_millis = cores * 1000;
        self
    }

    /// Sets memory in bytes.
    #[must_use]
    pub const fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Sets memory in mebibytes.
    #[must_use]
    pub const fn with_memory_mib(mut self, mib: u64) -> Self {
        self.memory_bytes = mib * MIB;
        self
    }

    /// Sets memory in gibibytes.
    #[must_use]
    pub const fn with_memory_gib(mut self, gib: u64) -> Self {
        self.memory_bytes = gib * GIB;
        self
    }

    /// Sets the GPU count.
    #[must_use]
    pub const fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    /// Sets the pod slot count.
    #[must_use]
    pub const fn with_pods(mut self, pods: u32) -> Self {
        self.pods = pods;
        self
    }

    /// Component-wise sum.
    #[must_use]
    pub const fn add(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            gpus: self.gpus.saturating_add(other.gpus),
            pods: self.pods.saturating_add(other.pods),
        }
    }

    /// Component-wise difference, clamped at zero.
    #[must_use]
    pub const fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            gpus: self.gpus.saturating_sub(other.gpus),
            pods: self.pods.saturating_sub(other.pods),
        }
    }

    /// Component-wise maximum.
    #[must_use]
    pub fn max(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
            gpus: self.gpus.max(other.gpus),
            pods: self.pods.max(other.pods),
        }
    }

    /// Returns true if every component of `self` fits within `available`.
    #[must_use]
    pub const fn fits_in(&self, available: &Self) -> bool {
        self.cpu_millis <= available.cpu_millis
            && self.memory_bytes <= available.memory_bytes
            && self.gpus <= available.gpus
            && self.pods <= available.pods
    }

    /// Returns true if every component is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.gpus == 0 && self.pods == 0
    }

    /// Ordering key used for largest-first sorting and best-fit comparisons.
    ///
    /// CPU dominates, then memory, then GPUs. Pod slots are ignored.
    #[must_use]
    pub const fn sort_key(&self) -> (u64, u64, u32) {
        (self.cpu_millis, self.memory_bytes, self.gpus)
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={}m memory={}Mi gpus={} pods={}",
            self.cpu_millis,
            self.memory_bytes / MIB,
            self.gpus,
            self.pods
        )
    }
}

impl std::iter::Sum for Resources {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::new(), |acc, r| acc.add(&r))
    }
}
