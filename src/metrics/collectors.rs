//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_SANDBOXES, PATCH_BYTES, PHASE_DURATION, RUNS_TOTAL, RUN_DURATION, TEARDOWN_FAILURES,
};

/// Metrics collector for recording runner operational metrics.
///
/// Every method is a no-op until `init_metrics()` has been called, so library
/// users that never export metrics pay nothing.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished run.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal run status (e.g., "succeeded", "timeout", "failed")
    /// * `backend` - Sandbox backend name ("docker" or "process")
    /// * `duration_secs` - End-to-end duration in seconds
    pub fn record_run(&self, status: &str, backend: &str, duration_secs: f64) {
        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total.with_label_values(&[status, backend]).inc();
        }

        if let Some(run_duration) = RUN_DURATION.get() {
            run_duration
                .with_label_values(&[status])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            backend = backend,
            duration_secs = duration_secs,
            "Recorded run metric"
        );
    }

    /// Record the time spent in one phase.
    pub fn record_phase(&self, phase: &str, duration_secs: f64) {
        if let Some(phase_duration) = PHASE_DURATION.get() {
            phase_duration
                .with_label_values(&[phase])
                .observe(duration_secs);
        }
    }

    /// Record the size of a produced patch.
    pub fn record_patch(&self, bytes: usize) {
        if let Some(patch_bytes) = PATCH_BYTES.get() {
            patch_bytes.observe(bytes as f64);
        }
    }

    /// Record that a sandbox was launched.
    pub fn sandbox_started(&self) {
        if let Some(active) = ACTIVE_SANDBOXES.get() {
            active.inc();
        }
    }

    /// Record that a sandbox was released.
    pub fn sandbox_released(&self) {
        if let Some(active) = ACTIVE_SANDBOXES.get() {
            active.dec();
        }
    }

    /// Record a teardown step that failed or exceeded its grace period.
    pub fn record_teardown_failure(&self, step: &str) {
        if let Some(failures) = TEARDOWN_FAILURES.get() {
            failures.with_label_values(&[step]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::init_metrics;

    #[test]
    fn test_collector_records_after_init() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_run("succeeded", "process", 1.5);
        collector.record_phase("executing", 1.0);
        collector.record_patch(120);
        collector.record_teardown_failure("kill");

        if let Some(runs) = RUNS_TOTAL.get() {
            assert!(runs.with_label_values(&["succeeded", "process"]).get() >= 1.0);
        }
        if let Some(failures) = TEARDOWN_FAILURES.get() {
            assert!(failures.with_label_values(&["kill"]).get() >= 1.0);
        }
    }

    #[test]
    fn test_sandbox_gauge_balances() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.sandbox_started();
        collector.sandbox_released();
        // Other tests may run concurrently; only check the calls are accepted.
        if let Some(active) = ACTIVE_SANDBOXES.get() {
            assert!(active.get().is_finite());
        }
    }
}
