//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by repose_forge and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all repose_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Outputs reaching a terminal state, labeled by status.
pub static OUTPUTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation calls, labeled by model and outcome (success/transient/permanent).
pub static GENERATION_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation call latency in seconds, labeled by model.
pub static GENERATION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Runs reaching a terminal state, labeled by status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation calls currently in flight.
pub static OUTPUTS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Records reset to queued by the liveness sweeper, labeled by kind.
pub static RECLAIMED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Self-continuations dispatched.
pub static CONTINUATIONS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Processor invocations, labeled by outcome.
pub static INVOCATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of tickets in a queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of supervisor workers currently running an invocation.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording through `MetricsCollector` before this
/// is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Output and run metrics
    let outputs_total = CounterVec::new(
        Opts::new(
            "repose_outputs_total",
            "Outputs reaching a terminal state",
        ),
        &["status"],
    )?;

    let generation_attempts_total = CounterVec::new(
        Opts::new(
            "repose_generation_attempts_total",
            "Generation calls by outcome",
        ),
        &["model", "outcome"],
    )?;

    let generation_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "repose_generation_latency_seconds",
            "Generation call latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0, 90.0]),
        &["model"],
    )?;

    let runs_total = CounterVec::new(
        Opts::new("repose_runs_total", "Runs reaching a terminal state"),
        &["status"],
    )?;

    let outputs_in_flight = Gauge::new(
        "repose_outputs_in_flight",
        "Generation calls currently in flight",
    )?;

    // Liveness and continuation metrics
    let reclaimed_total = CounterVec::new(
        Opts::new(
            "repose_reclaimed_total",
            "Stale records reset to queued",
        ),
        &["kind"],
    )?;

    let continuations_total = Counter::new(
        "repose_continuations_total",
        "Self-continuations dispatched",
    )?;

    let invocations_total = CounterVec::new(
        Opts::new("repose_invocations_total", "Processor invocations by outcome"),
        &["outcome"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("repose_queue_depth", "Number of tickets in queue"),
        &["queue_name"],
    )?;

    let active_workers = Gauge::new(
        "repose_active_workers",
        "Number of workers running an invocation",
    )?;

    registry.register(Box::new(outputs_total.clone()))?;
    registry.register(Box::new(generation_attempts_total.clone()))?;
    registry.register(Box::new(generation_latency.clone()))?;
    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(outputs_in_flight.clone()))?;
    registry.register(Box::new(reclaimed_total.clone()))?;
    registry.register(Box::new(continuations_total.clone()))?;
    registry.register(Box::new(invocations_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set cells mean a previous init won; keep the first registry.
    let _ = REGISTRY.set(registry);
    let _ = OUTPUTS_TOTAL.set(outputs_total);
    let _ = GENERATION_ATTEMPTS_TOTAL.set(generation_attempts_total);
    let _ = GENERATION_LATENCY.set(generation_latency);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = OUTPUTS_IN_FLIGHT.set(outputs_in_flight);
    let _ = RECLAIMED_TOTAL.set(reclaimed_total);
    let _ = CONTINUATIONS_TOTAL.set(continuations_total);
    let _ = INVOCATIONS_TOTAL.set(invocations_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
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
