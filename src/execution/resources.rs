//! Resource ceilings for sandboxed agent execution.
//!
//! The same limits drive both backends: the Docker backend maps them onto
//! the container's cgroup settings, the process backend onto POSIX rlimits.

use serde::{Deserialize, Serialize};

/// Resource ceilings for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0). Zero means unlimited.
    pub cpu_cores: f64,
    /// Maximum number of processes allowed inside the sandbox.
    pub max_processes: u64,
    /// Maximum number of open file descriptors per process.
    pub max_open_files: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        // Matches the defaults the hosted runner used: 2g / 2 CPUs
        Self {
            memory_mb: 2048,
            cpu_cores: 2.0,
            max_processes: 256,
            max_open_files: 4096,
        }
    }
}

impl ExecutionLimits {
    /// Creates new execution limits with the given parameters.
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64, max_open_files: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
            max_open_files,
        }
    }

    /// Sets the memory limit in megabytes.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Sets the CPU limit.
    pub fn with_cpu_cores(mut self, cores: f64) -> Self {
        self.cpu_cores = cores;
        self
    }

    /// Returns memory limit in bytes, saturating at `i64::MAX`.
    pub fn memory_bytes(&self) -> i64 {
        let bytes = self.memory_mb.saturating_mul(1024 * 1024);
        i64::try_from(bytes).unwrap_or(i64::MAX)
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 1.0 core = 100000 quota (100% of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Returns true if a CPU ceiling should be applied.
    pub fn has_cpu_limit(&self) -> bool {
        self.cpu_cores > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.memory_mb, 2048);
        assert_eq!(limits.cpu_cores, 2.0);
        assert!(limits.has_cpu_limit());
    }

    #[test]
    fn test_memory_bytes_conversion() {
        let limits = ExecutionLimits::new(512, 1.0, 100, 1024);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_huge_memory_saturates() {
        assert_eq!(ExecutionLimits::default().with_memory_mb(u64::MAX).memory_bytes(), i64::MAX);
        let just_over = (i64::MAX as u64) / (1024 * 1024) + 1;
        assert_eq!(ExecutionLimits::default().with_memory_mb(just_over).memory_bytes(), i64::MAX);
    }

    #[test]
    fn test_cpu_quota_calculation() {
        let limits = ExecutionLimits::new(512, 2.0, 100, 1024);
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 200_000);
    }

    #[test]
    fn test_zero_cpu_means_unlimited() {
        let limits = ExecutionLimits::default().with_cpu_cores(0.0);
        assert!(!limits.has_cpu_limit());
    }
}
