//! Output executor: drives queued outputs through the generator.
//!
//! Outputs are processed in slices of `output_concurrency`. A slice is
//! awaited as a group; between slices the owning run's heartbeat is
//! refreshed, the deadline is checked and a short pause is inserted.
//! Every generation call additionally holds a permit of a shared
//! semaphore, so several executors never exceed the bound together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::GenerationError;
use crate::generation::{GeneratedOutput, OutputGenerator};
use crate::metrics::{AttemptOutcome, MetricsCollector};
use crate::scheduler::models::{Output, OutputStatus, Run, RunOutcome, RunStatus};
use crate::storage::{BatchStore, StoreError};

/// Tunables of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub inter_batch_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&ProcessorConfig::default())
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            concurrency: config.output_concurrency.max(1),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            inter_batch_delay: config.inter_batch_delay,
        }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * attempt
    }
}

/// What happened to the outputs handed to [`OutputExecutor::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceReport {
    pub completed: usize,
    pub failed: usize,
    /// Outputs another invocation claimed first, or reclaimed before the
    /// result was written.
    pub skipped: usize,
    /// Outputs left queued because the deadline passed.
    pub deferred: usize,
}

impl SliceReport {
    pub fn deadline_hit(&self) -> bool {
        self.deferred > 0
    }

    fn absorb(&mut self, status: Option<OutputStatus>) {
        match status {
            Some(OutputStatus::Complete) => self.completed += 1,
            Some(OutputStatus::Failed) => self.failed += 1,
            _ => self.skipped += 1,
        }
    }
}

/// Terminal state of one run's execution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExecution {
    /// All outputs terminal; the run was finished with this status.
    Settled(RunStatus),
    /// The deadline passed with outputs still queued; the run was released.
    OutOfTime,
    /// Outputs are held `running` elsewhere; the run was released.
    Contended,
}

pub struct OutputExecutor {
    store: Arc<dyn BatchStore>,
    generator: Arc<dyn OutputGenerator>,
    semaphore: Arc<Semaphore>,
    settings: ExecutorSettings,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    metrics: MetricsCollector,
}

impl OutputExecutor {
    pub fn new(
        store: Arc<dyn BatchStore>,
        generator: Arc<dyn OutputGenerator>,
        settings: ExecutorSettings,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.concurrency));
        Self {
            store,
            generator,
            semaphore,
            settings,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Shares a permit pool with other executors.
    pub fn with_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.semaphore = semaphore;
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Highest number of simultaneous generation calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Executes the queued outputs of a claimed run and settles it.
    ///
    /// The run is finished only once every one of its outputs is terminal;
    /// otherwise it is released back to `queued`.
    pub async fn execute_run(
        &self,
        run: &Run,
        model: &str,
        deadline: Instant,
    ) -> Result<RunExecution, StoreError> {
        let outputs = self.store.queued_outputs_for_run(run.id).await?;
        debug!(run_id = %run.id, queued = outputs.len(), "Executing run outputs");

        let report = self.execute(&outputs, model, deadline, Some(run.id)).await?;

        let counts = self.store.count_run_outputs(run.id).await?;
        if counts.pending() > 0 {
            self.store.release_run(run.id).await?;
            let outcome = if report.deadline_hit() || counts.queued > 0 {
                RunExecution::OutOfTime
            } else {
                RunExecution::Contended
            };
            info!(
                run_id = %run.id,
                queued = counts.queued,
                running = counts.running,
                outcome = ?outcome,
                "Released run with pending outputs"
            );
            return Ok(outcome);
        }

        let outcome = RunOutcome::from_counts(&counts);
        if self.store.finish_run(run.id, &outcome, Utc::now()).await? {
            self.metrics.record_run(outcome.status.as_str());
            info!(
                run_id = %run.id,
                status = %outcome.status,
                output_count = outcome.output_count,
                failed = counts.failed,
                "Run settled"
            );
        } else {
            warn!(run_id = %run.id, "Run was no longer running when settling");
        }
        Ok(RunExecution::Settled(outcome.status))
    }

    /// Processes `outputs` slice by slice until done or past `deadline`.
    ///
    /// When `heartbeat_run` is set, that run's heartbeat is refreshed after
    /// every slice.
    pub async fn execute(
        &self,
        outputs: &[Output],
        model: &str,
        deadline: Instant,
        heartbeat_run: Option<Uuid>,
    ) -> Result<SliceReport, StoreError> {
        let mut report = SliceReport::default();
        let slices: Vec<&[Output]> = outputs.chunks(self.settings.concurrency).collect();

        for (index, slice) in slices.iter().enumerate() {
            if Instant::now() >= deadline {
                report.deferred = slices[index..].iter().map(|s| s.len()).sum();
                info!(
                    deferred = report.deferred,
                    "Time budget reached, leaving outputs queued"
                );
                break;
            }

            let results = join_all(slice.iter().map(|output| self.execute_output(output, model))).await;
            for result in results {
                report.absorb(result?);
            }

            if let Some(run_id) = heartbeat_run {
                if !self.store.heartbeat_run(run_id, Utc::now()).await? {
                    warn!(run_id = %run_id, "Heartbeat did not apply, run no longer running");
                }
            }

            if index + 1 < slices.len() && !self.settings.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_batch_delay).await;
            }
        }

        Ok(report)
    }

    /// Claims and generates one output, returning its terminal status, or
    /// `None` when another invocation owns it or reclaimed it mid-call.
    async fn execute_output(
        &self,
        output: &Output,
        model: &str,
    ) -> Result<Option<OutputStatus>, StoreError> {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(output_id = %output.id, "Executor semaphore closed");
                return Ok(None);
            }
        };

        if !self.store.claim_output(output.id, Utc::now()).await? {
            debug!(output_id = %output.id, "Output already claimed elsewhere");
            return Ok(None);
        }

        self.enter_flight();
        let result = self.generate_with_retry(output, model).await;
        self.leave_flight();

        let now = Utc::now();
        let (status, applied) = match result {
            Ok(generated) => {
                let applied = self
                    .store
                    .complete_output(output.id, generated.result_url.as_deref(), now)
                    .await?;
                (OutputStatus::Complete, applied)
            }
            Err(e) => {
                let applied = self.store.fail_output(output.id, &e.to_string(), now).await?;
                (OutputStatus::Failed, applied)
            }
        };
        if !applied {
            warn!(
                output_id = %output.id,
                status = %status,
                "Output result not recorded, output no longer running"
            );
            return Ok(None);
        }
        self.metrics.record_output(status.as_str());
        Ok(Some(status))
    }

    async fn generate_with_retry(
        &self,
        output: &Output,
        model: &str,
    ) -> Result<GeneratedOutput, GenerationError> {
        let max_retries = self.settings.max_retries;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay(attempt)).await;
            }

            let started = Instant::now();
            let result = self.generator.generate(output, model).await;
            let latency = started.elapsed().as_secs_f64();

            match result {
                Ok(generated) => {
                    self.metrics
                        .record_generation_attempt(model, AttemptOutcome::Success, latency);
                    debug!(output_id = %output.id, attempt = attempt + 1, "Output generated");
                    return Ok(generated);
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    self.metrics
                        .record_generation_attempt(model, AttemptOutcome::Transient, latency);
                    attempt += 1;
                    warn!(
                        output_id = %output.id,
                        attempt = attempt,
                        max_retries = max_retries,
                        error = %e,
                        "Transient generation error, retrying"
                    );
                }
                Err(e) => {
                    let outcome = if e.is_retryable() {
                        AttemptOutcome::Transient
                    } else {
                        AttemptOutcome::Permanent
                    };
                    self.metrics.record_generation_attempt(model, outcome, latency);
                    error!(
                        output_id = %output.id,
                        attempts = attempt + 1,
                        error = %e,
                        "Output generation failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn enter_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.metrics.inc_in_flight();
    }

    fn leave_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.metrics.dec_in_flight();
    }
}
