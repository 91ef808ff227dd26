//! Prometheus metrics for the batch processor.
//!
//! # Example
//!
//! ```ignore
//! use repose_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_output("complete");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{AttemptOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CONTINUATIONS_TOTAL, GENERATION_ATTEMPTS_TOTAL, GENERATION_LATENCY,
    INVOCATIONS_TOTAL, OUTPUTS_IN_FLIGHT, OUTPUTS_TOTAL, QUEUE_DEPTH, RECLAIMED_TOTAL, REGISTRY,
    RUNS_TOTAL,
};
