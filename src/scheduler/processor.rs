//! Self-continuation controller: one bounded invocation over a batch.
//!
//! # Phases
//!
//! ```text
//! Sweeping -> Dispatching <-> ProgressUpdate
//!                  |               |
//!                  |               +-> Continuing (time budget spent)
//!                  v
//!           DrainingOrphans -> Finalizing
//! ```
//!
//! The time budget is checked before every dispatch cycle and between output
//! slices. In-flight generation calls are always awaited; once the budget is
//! spent no new slice starts, the settled run ids are carried forward in a
//! `ResumeContext` and exactly one continuation is dispatched.
//!
//! Cancellation is cooperative: a `CANCELED` or `PAUSED` pipeline job halts
//! the loop before the next dispatch cycle. Work left `running` is reclaimed
//! by a later sweep.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::ProcessorError;
use crate::generation::OutputGenerator;
use crate::metrics::MetricsCollector;
use crate::scheduler::executor::{ExecutorSettings, OutputExecutor, RunExecution};
use crate::scheduler::expander::{Expansion, RunExpander};
use crate::scheduler::job::ProcessRequest;
use crate::scheduler::models::{
    BatchStatus, JobProgress, OutputCounts, PipelineJobStatus, Run, RunOutcome,
};
use crate::scheduler::queue::ContinuationSink;
use crate::scheduler::sweeper::LivenessSweeper;
use crate::storage::BatchStore;

/// Phase of an invocation, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sweeping,
    Dispatching,
    ProgressUpdate,
    Continuing,
    DrainingOrphans,
    Finalizing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Sweeping => "SWEEPING",
            Phase::Dispatching => "DISPATCHING",
            Phase::ProgressUpdate => "PROGRESS_UPDATE",
            Phase::Continuing => "CONTINUING",
            Phase::DrainingOrphans => "DRAINING_ORPHANS",
            Phase::Finalizing => "FINALIZING",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The batch was finalized. `Running` means outputs are still held by
    /// another invocation.
    Finished(PipelineJobStatus),
    /// The budget ran out and a continuation was dispatched.
    Continued {
        processed_runs: usize,
        continuation_depth: u32,
    },
    /// The pipeline job was canceled or paused.
    Halted(PipelineJobStatus),
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::Finished(_) => "finished",
            InvocationOutcome::Continued { .. } => "continued",
            InvocationOutcome::Halted(_) => "halted",
        }
    }
}

/// Result of dispatching one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunDisposition {
    /// Terminal; goes into the processed set.
    Settled,
    /// Released with queued outputs because time ran out.
    OutOfTime,
    /// Skipped for the rest of this invocation.
    Deferred,
}

/// Bookkeeping of one invocation.
struct InvocationState {
    processed: BTreeSet<Uuid>,
    deferred: HashSet<Uuid>,
}

impl InvocationState {
    fn excluded(&self) -> HashSet<Uuid> {
        self.processed
            .iter()
            .chain(self.deferred.iter())
            .copied()
            .collect()
    }
}

/// Runs bounded invocations of the batch processor.
pub struct BatchProcessor {
    store: Arc<dyn BatchStore>,
    sweeper: LivenessSweeper,
    expander: RunExpander,
    executor: OutputExecutor,
    sink: Arc<dyn ContinuationSink>,
    config: ProcessorConfig,
    metrics: MetricsCollector,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn BatchStore>,
        generator: Arc<dyn OutputGenerator>,
        sink: Arc<dyn ContinuationSink>,
        config: ProcessorConfig,
    ) -> Self {
        let sweeper = LivenessSweeper::new(store.clone(), config.stale_threshold_chrono());
        let expander = RunExpander::new(store.clone(), config.default_poses_per_shot_type);
        let executor = OutputExecutor::new(
            store.clone(),
            generator,
            ExecutorSettings::from_config(&config),
        );
        Self {
            store,
            sweeper,
            expander,
            executor,
            sink,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Fixes the pose sampling seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.expander = self.expander.with_seed(seed);
        self
    }

    /// Shares the generation permit pool with other processors.
    pub fn with_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.executor = self.executor.with_semaphore(semaphore);
        self
    }

    pub fn executor(&self) -> &OutputExecutor {
        &self.executor
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Runs one invocation within the configured time budget.
    ///
    /// An error fails the pipeline job with the error message; a later
    /// invocation can still recover the outstanding work.
    pub async fn process(
        &self,
        request: &ProcessRequest,
    ) -> Result<InvocationOutcome, ProcessorError> {
        let deadline = Instant::now() + self.config.time_budget;
        info!(
            batch_id = %request.batch_id,
            pipeline_job_id = %request.pipeline_job_id,
            model = %request.model,
            continuation_depth = request.resume_context.continuation_depth,
            processed_runs = request.resume_context.processed_run_ids.len(),
            "Starting invocation"
        );

        match self.run_invocation(request, deadline).await {
            Ok(outcome) => {
                self.metrics.record_invocation(outcome.as_str());
                info!(batch_id = %request.batch_id, outcome = ?outcome, "Invocation finished");
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_invocation("failed");
                error!(batch_id = %request.batch_id, error = %e, "Invocation failed");
                let message = e.to_string();
                if let Err(store_err) = self
                    .store
                    .set_job_status(request.pipeline_job_id, PipelineJobStatus::Failed, Some(&message))
                    .await
                {
                    error!(
                        pipeline_job_id = %request.pipeline_job_id,
                        error = %store_err,
                        "Failed to mark pipeline job failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_invocation(
        &self,
        request: &ProcessRequest,
        deadline: Instant,
    ) -> Result<InvocationOutcome, ProcessorError> {
        let batch_id = request.batch_id;
        let job_id = request.pipeline_job_id;

        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or(ProcessorError::BatchNotFound(batch_id))?;
        if batch.status != BatchStatus::Running {
            debug!(batch_id = %batch_id, status = %batch.status, "Processing a batch that is not RUNNING");
        }
        self.store
            .get_pipeline_job(job_id)
            .await?
            .ok_or(ProcessorError::PipelineJobNotFound(job_id))?;

        self.enter(Phase::Sweeping, batch_id);
        self.sweeper.sweep(batch_id).await?;

        let mut state = InvocationState {
            processed: request.resume_context.processed_run_ids.clone(),
            deferred: HashSet::new(),
        };

        loop {
            if Instant::now() >= deadline {
                return self.continue_invocation(request, &state).await;
            }
            if let Some(status) = self.halt_status(job_id).await? {
                return Ok(self.halt(batch_id, status));
            }

            self.enter(Phase::Dispatching, batch_id);
            let runs = self
                .store
                .fetch_queued_runs(batch_id, self.config.run_slice_size, &state.excluded())
                .await?;
            if runs.is_empty() {
                break;
            }

            let results = join_all(
                runs.iter()
                    .map(|run| self.dispatch_run(run, &request.model, deadline)),
            )
            .await;
            for (run, result) in runs.iter().zip(results) {
                match result? {
                    RunDisposition::Settled => {
                        state.processed.insert(run.id);
                    }
                    RunDisposition::Deferred => {
                        state.deferred.insert(run.id);
                    }
                    RunDisposition::OutOfTime => {}
                }
            }

            self.enter(Phase::ProgressUpdate, batch_id);
            let counts = self.store.count_batch_outputs(batch_id).await?;
            let progress = JobProgress::from_counts(&counts, progress_message(&counts));
            self.store.update_job_progress(job_id, &progress).await?;
        }

        self.enter(Phase::DrainingOrphans, batch_id);
        if self.drain_orphans(batch_id, &request.model, deadline).await? {
            return self.continue_invocation(request, &state).await;
        }

        self.enter(Phase::Finalizing, batch_id);
        self.finalize(batch_id, job_id, &state).await
    }

    /// Claims, expands if needed, and executes one run.
    async fn dispatch_run(
        &self,
        run: &Run,
        model: &str,
        deadline: Instant,
    ) -> Result<RunDisposition, ProcessorError> {
        if !self.store.claim_run(run.id, Utc::now()).await? {
            debug!(run_id = %run.id, "Run claimed by another invocation");
            return Ok(RunDisposition::Deferred);
        }

        // A run released by an earlier invocation already has its outputs.
        let existing = self.store.count_run_outputs(run.id).await?;
        if existing.total() == 0 {
            match self.expander.expand(run).await? {
                Expansion::Empty | Expansion::Failed(_) => return Ok(RunDisposition::Settled),
                Expansion::Planned { .. } => {}
            }
        } else {
            debug!(run_id = %run.id, existing = existing.total(), "Resuming run without expansion");
        }

        let disposition = match self.executor.execute_run(run, model, deadline).await? {
            RunExecution::Settled(_) => RunDisposition::Settled,
            RunExecution::OutOfTime => RunDisposition::OutOfTime,
            RunExecution::Contended => RunDisposition::Deferred,
        };
        Ok(disposition)
    }

    /// Processes queued outputs whose run is already terminal and re-settles
    /// those runs, a page of `orphan_drain_limit` at a time. Returns whether
    /// the deadline left orphans behind.
    async fn drain_orphans(
        &self,
        batch_id: Uuid,
        model: &str,
        deadline: Instant,
    ) -> Result<bool, ProcessorError> {
        loop {
            let orphans = self
                .store
                .orphaned_outputs(batch_id, self.config.orphan_drain_limit)
                .await?;
            if orphans.is_empty() {
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(true);
            }
            info!(batch_id = %batch_id, orphans = orphans.len(), "Draining orphaned outputs");

            let report = self.executor.execute(&orphans, model, deadline, None).await?;

            let run_ids: BTreeSet<Uuid> = orphans.iter().map(|o| o.run_id).collect();
            for run_id in run_ids {
                let counts = self.store.count_run_outputs(run_id).await?;
                if counts.pending() > 0 {
                    continue;
                }
                let outcome = RunOutcome::from_counts(&counts);
                if self.store.resettle_run(run_id, &outcome, Utc::now()).await? {
                    debug!(run_id = %run_id, status = %outcome.status, "Re-settled run after drain");
                }
            }

            if report.deadline_hit() {
                return Ok(true);
            }
        }
    }

    async fn finalize(
        &self,
        batch_id: Uuid,
        job_id: Uuid,
        state: &InvocationState,
    ) -> Result<InvocationOutcome, ProcessorError> {
        let counts = self.store.count_batch_outputs(batch_id).await?;

        if counts.pending() > 0 || !state.deferred.is_empty() {
            let message = format!(
                "{} outputs still in progress ({}/{} done)",
                counts.pending(),
                counts.complete,
                counts.total()
            );
            self.store
                .update_job_progress(job_id, &JobProgress::from_counts(&counts, message))
                .await?;
            info!(
                batch_id = %batch_id,
                pending = counts.pending(),
                deferred_runs = state.deferred.len(),
                "Batch still has work held elsewhere"
            );
            return Ok(InvocationOutcome::Finished(PipelineJobStatus::Running));
        }

        let (job_status, batch_status, message) = final_status(&counts);
        self.store
            .update_job_progress(job_id, &JobProgress::from_counts(&counts, message.clone()))
            .await?;
        if !self.store.set_job_status(job_id, job_status, Some(&message)).await? {
            warn!(pipeline_job_id = %job_id, "Pipeline job was canceled or paused before finalizing");
            let status = self
                .halt_status(job_id)
                .await?
                .unwrap_or(PipelineJobStatus::Canceled);
            return Ok(InvocationOutcome::Halted(status));
        }
        self.store.set_batch_status(batch_id, batch_status).await?;

        info!(
            batch_id = %batch_id,
            status = %job_status,
            complete = counts.complete,
            failed = counts.failed,
            "Batch finalized"
        );
        Ok(InvocationOutcome::Finished(job_status))
    }

    async fn continue_invocation(
        &self,
        request: &ProcessRequest,
        state: &InvocationState,
    ) -> Result<InvocationOutcome, ProcessorError> {
        self.enter(Phase::Continuing, request.batch_id);

        let depth = request.resume_context.continuation_depth;
        if depth >= self.config.max_continuations {
            return Err(ProcessorError::ContinuationLimit(self.config.max_continuations));
        }

        let next = request.continuation(state.processed.iter().copied());
        let processed_runs = next.resume_context.processed_run_ids.len();
        let continuation_depth = next.resume_context.continuation_depth;

        self.sink.dispatch(next).await?;
        self.metrics.record_continuation();

        let counts = self.store.count_batch_outputs(request.batch_id).await?;
        let message = format!(
            "Continuing in invocation {} ({}/{} outputs done)",
            continuation_depth + 1,
            counts.complete,
            counts.total()
        );
        self.store
            .update_job_progress(
                request.pipeline_job_id,
                &JobProgress::from_counts(&counts, message),
            )
            .await?;

        info!(
            batch_id = %request.batch_id,
            processed_runs = processed_runs,
            continuation_depth = continuation_depth,
            "Time budget spent, continuation dispatched"
        );
        Ok(InvocationOutcome::Continued {
            processed_runs,
            continuation_depth,
        })
    }

    /// The job status when it asks processing to stop.
    async fn halt_status(&self, job_id: Uuid) -> Result<Option<PipelineJobStatus>, ProcessorError> {
        let job = self
            .store
            .get_pipeline_job(job_id)
            .await?
            .ok_or(ProcessorError::PipelineJobNotFound(job_id))?;
        Ok(Some(job.status).filter(|s| s.halts_processing()))
    }

    fn halt(&self, batch_id: Uuid, status: PipelineJobStatus) -> InvocationOutcome {
        info!(batch_id = %batch_id, status = %status, "Pipeline job halted, stopping");
        InvocationOutcome::Halted(status)
    }

    fn enter(&self, phase: Phase, batch_id: Uuid) {
        debug!(batch_id = %batch_id, phase = %phase, "Entering phase");
    }
}

fn progress_message(counts: &OutputCounts) -> String {
    format!(
        "Processed {}/{} outputs ({} failed)",
        counts.terminal(),
        counts.total(),
        counts.failed
    )
}

/// Terminal job and batch status for a batch with no pending outputs.
fn final_status(counts: &OutputCounts) -> (PipelineJobStatus, BatchStatus, String) {
    if counts.complete == 0 && counts.failed > 0 {
        return (
            PipelineJobStatus::Failed,
            BatchStatus::Failed,
            format!("All {} outputs failed", counts.failed),
        );
    }
    let message = if counts.failed > 0 {
        format!("Completed {} outputs, {} failed", counts.complete, counts.failed)
    } else {
        format!("Completed {} outputs", counts.complete)
    };
    (PipelineJobStatus::Completed, BatchStatus::Complete, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(complete: u64, failed: u64) -> OutputCounts {
        OutputCounts {
            queued: 0,
            running: 0,
            complete,
            failed,
        }
    }

    #[test]
    fn test_final_status_all_complete() {
        let (job, batch, message) = final_status(&counts(4, 0));
        assert_eq!(job, PipelineJobStatus::Completed);
        assert_eq!(batch, BatchStatus::Complete);
        assert_eq!(message, "Completed 4 outputs");
    }

    #[test]
    fn test_final_status_partial_success_reports_failures() {
        let (job, _, message) = final_status(&counts(3, 2));
        assert_eq!(job, PipelineJobStatus::Completed);
        assert!(message.contains("2 failed"));
    }

    #[test]
    fn test_final_status_nothing_succeeded() {
        let (job, batch, message) = final_status(&counts(0, 5));
        assert_eq!(job, PipelineJobStatus::Failed);
        assert_eq!(batch, BatchStatus::Failed);
        assert!(message.contains('5'));
    }

    #[test]
    fn test_final_status_empty_batch_completes() {
        let (job, _, _) = final_status(&counts(0, 0));
        assert_eq!(job, PipelineJobStatus::Completed);
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(Phase::DrainingOrphans.to_string(), "DRAINING_ORPHANS");
        assert_eq!(Phase::Continuing.as_str(), "CONTINUING");
    }

    #[test]
    fn test_invocation_outcome_labels() {
        assert_eq!(
            InvocationOutcome::Finished(PipelineJobStatus::Completed).as_str(),
            "finished"
        );
        assert_eq!(
            InvocationOutcome::Continued {
                processed_runs: 1,
                continuation_depth: 1
            }
            .as_str(),
            "continued"
        );
    }
}
