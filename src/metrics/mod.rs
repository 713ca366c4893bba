//! Metrics module for Prometheus-based monitoring.
//!
//! Counts finished runs by status, times each phase, tracks live sandboxes and
//! failed teardown steps.
//!
//! # Example
//!
//! ```ignore
//! use agent_runner::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_run("succeeded", "docker", 42.0);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_SANDBOXES, PATCH_BYTES, PHASE_DURATION, REGISTRY, RUNS_TOTAL, RUN_DURATION,
    TEARDOWN_FAILURES,
};
