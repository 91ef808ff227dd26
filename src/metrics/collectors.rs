//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! and tests can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, CONTINUATIONS_TOTAL, GENERATION_ATTEMPTS_TOTAL, GENERATION_LATENCY,
    INVOCATIONS_TOTAL, OUTPUTS_IN_FLIGHT, OUTPUTS_TOTAL, QUEUE_DEPTH, RECLAIMED_TOTAL, RUNS_TOTAL,
};

/// Outcome label of one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Transient,
    Permanent,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Transient => "transient",
            AttemptOutcome::Permanent => "permanent",
        }
    }
}

/// Metrics collector for recording processor metrics.
///
/// # Example
///
/// ```ignore
/// use repose_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_output("complete");
/// collector.record_reclaimed("run", 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one generation call and its latency.
    pub fn record_generation_attempt(
        &self,
        model: &str,
        outcome: AttemptOutcome,
        latency_secs: f64,
    ) {
        if let Some(attempts) = GENERATION_ATTEMPTS_TOTAL.get() {
            attempts
                .with_label_values(&[model, outcome.as_str()])
                .inc();
        }

        if let Some(latency) = GENERATION_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }

        tracing::trace!(
            model = model,
            outcome = outcome.as_str(),
            latency_secs = latency_secs,
            "Recorded generation attempt metric"
        );
    }

    /// Record an output reaching a terminal status.
    pub fn record_output(&self, status: &str) {
        if let Some(outputs) = OUTPUTS_TOTAL.get() {
            outputs.with_label_values(&[status]).inc();
        }
    }

    /// Record a run reaching a terminal status.
    pub fn record_run(&self, status: &str) {
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[status]).inc();
        }
    }

    pub fn inc_in_flight(&self) {
        if let Some(gauge) = OUTPUTS_IN_FLIGHT.get() {
            gauge.inc();
        }
    }

    pub fn dec_in_flight(&self) {
        if let Some(gauge) = OUTPUTS_IN_FLIGHT.get() {
            gauge.dec();
        }
    }

    /// Record records reclaimed by the liveness sweeper.
    ///
    /// # Arguments
    ///
    /// * `kind` - "run" or "output"
    /// * `count` - Number of records reset to queued
    pub fn record_reclaimed(&self, kind: &str, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(reclaimed) = RECLAIMED_TOTAL.get() {
            reclaimed.with_label_values(&[kind]).inc_by(count as f64);
        }
    }

    pub fn record_continuation(&self) {
        if let Some(continuations) = CONTINUATIONS_TOTAL.get() {
            continuations.inc();
        }
    }

    /// Record the outcome of one processor invocation.
    pub fn record_invocation(&self, outcome: &str) {
        if let Some(invocations) = INVOCATIONS_TOTAL.get() {
            invocations.with_label_values(&[outcome]).inc();
        }
        tracing::trace!(outcome = outcome, "Recorded invocation metric");
    }

    pub fn set_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    pub fn set_active_workers(&self, count: u64) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.set(count as f64);
        }
    }
}
