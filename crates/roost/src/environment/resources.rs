//! Conversion of logical workload limits into container resources.

use serde::{Deserialize, Serialize};

use crate::runtime::PlatformResources;

/// Fixed CFS period; the quota scales linearly with the CPU percentage.
pub const CPU_PERIOD: i64 = 100_000;

/// Relative CPU weight. Constant because the quota already caps usage.
pub const CPU_SHARES: i64 = 1024;

/// Swap value meaning "no swap limit".
pub const SWAP_UNLIMITED: i64 = -1;

const BYTES_PER_MB: i64 = 1_000_000;

/// Limits a workload is allowed to consume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory in MB. 0 means unbounded.
    pub memory_limit: i64,
    /// Swap in MB. -1 unlimited, 0 disabled.
    pub swap: i64,
    /// Percent of one core. 0 means unbounded.
    pub cpu_limit: i64,
    /// Core affinity, e.g. `0-1,3`.
    pub threads: String,
    pub io_weight: u16,
    pub process_limit: i64,
    pub oom_disabled: bool,
}

impl ResourceLimits {
    /// Reject values the conversion does not accept.
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_limit < 0 {
            return Err(format!("memory limit {} is negative", self.memory_limit));
        }
        if self.swap < SWAP_UNLIMITED {
            return Err(format!("swap {} is below -1", self.swap));
        }
        if self.cpu_limit < 0 {
            return Err(format!("cpu limit {} is negative", self.cpu_limit));
        }
        if self.process_limit < 0 {
            return Err(format!("process limit {} is negative", self.process_limit));
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_limit * BYTES_PER_MB
    }

    /// Combined memory and swap allowance, or the unlimited sentinel.
    pub fn converted_swap(&self) -> i64 {
        if self.swap < 0 {
            return SWAP_UNLIMITED;
        }
        self.memory_bytes() + self.swap * BYTES_PER_MB
    }

    /// CFS quota for [`CPU_PERIOD`].
    pub fn cpu_quota(&self) -> i64 {
        if self.cpu_limit <= 0 {
            return 0;
        }
        self.cpu_limit * CPU_PERIOD / 100
    }

    fn cpuset(&self) -> Option<String> {
        let threads = self.threads.trim();
        (!threads.is_empty()).then(|| threads.to_string())
    }
}

/// Turns [`ResourceLimits`] into what the host's runtime can enforce.
pub trait ResourceLimitStrategy: Send + Sync {
    fn convert(&self, limits: &ResourceLimits) -> PlatformResources;
}

/// cgroup hosts: every limit is enforced.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxResourceLimits;

impl ResourceLimitStrategy for LinuxResourceLimits {
    fn convert(&self, limits: &ResourceLimits) -> PlatformResources {
        PlatformResources {
            memory: Some(limits.memory_bytes()),
            memory_reservation: Some(limits.memory_bytes()),
            memory_swap: Some(limits.converted_swap()),
            cpu_quota: Some(limits.cpu_quota()),
            cpu_period: Some(CPU_PERIOD),
            cpu_shares: Some(CPU_SHARES),
            cpuset_cpus: limits.cpuset(),
            blkio_weight: (limits.io_weight > 0).then_some(limits.io_weight),
            oom_kill_disable: Some(limits.oom_disabled),
            pids_limit: Some(limits.process_limit),
        }
    }
}

/// Windows hosts: no swap, reservation, pid, IO weight or OOM controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsResourceLimits;

impl ResourceLimitStrategy for WindowsResourceLimits {
    fn convert(&self, limits: &ResourceLimits) -> PlatformResources {
        PlatformResources {
            memory: Some(limits.memory_bytes()),
            cpu_quota: Some(limits.cpu_quota()),
            cpu_shares: Some(CPU_SHARES),
            cpuset_cpus: limits.cpuset(),
            ..Default::default()
        }
    }
}
