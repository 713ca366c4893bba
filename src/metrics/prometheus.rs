//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by agent-runner and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all agent-runner metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished runs, labeled by status and backend.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end run duration in seconds, labeled by status.
pub static RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Time spent in each pipeline phase, labeled by phase.
pub static PHASE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of sandboxes currently alive.
pub static ACTIVE_SANDBOXES: OnceLock<Gauge> = OnceLock::new();

/// Teardown steps that failed or exceeded the grace period, labeled by step.
pub static TEARDOWN_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Size of produced patches in bytes.
pub static PATCH_BYTES: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("agent_runner_runs_total", "Total number of finished runs"),
        &["status", "backend"],
    )?;

    let run_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "agent_runner_run_duration_seconds",
            "End-to-end run duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["status"],
    )?;

    let phase_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "agent_runner_phase_duration_seconds",
            "Time spent in each run phase in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["phase"],
    )?;

    let active_sandboxes = Gauge::new(
        "agent_runner_active_sandboxes",
        "Number of sandboxes currently alive",
    )?;

    let teardown_failures = CounterVec::new(
        Opts::new(
            "agent_runner_teardown_failures_total",
            "Teardown steps that failed or timed out",
        ),
        &["step"],
    )?;

    let patch_bytes = Histogram::with_opts(
        prometheus::HistogramOpts::new("agent_runner_patch_bytes", "Size of produced patches")
            .buckets(vec![0.0, 100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]),
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(phase_duration.clone()))?;
    registry.register(Box::new(active_sandboxes.clone()))?;
    registry.register(Box::new(teardown_failures.clone()))?;
    registry.register(Box::new(patch_bytes.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = PHASE_DURATION.set(phase_duration);
    let _ = ACTIVE_SANDBOXES.set(active_sandboxes);
    let _ = TEARDOWN_FAILURES.set(teardown_failures);
    let _ = PATCH_BYTES.set(patch_bytes);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
