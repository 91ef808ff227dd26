//! In-memory `BatchStore` backing the test suites.
//!
//! Mirrors the conditional-update semantics of the Postgres store: each
//! write checks the record's current status under the lock and reports
//! whether it applied.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::scheduler::models::{
    Batch, BatchItem, BatchStatus, JobProgress, NewOutput, Output, OutputCounts, OutputStatus,
    PipelineJob, PipelineJobStatus, Pose, Run, RunOutcome, RunStatus,
};

use super::store::{BatchStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    batches: HashMap<Uuid, Batch>,
    jobs: HashMap<Uuid, PipelineJob>,
    runs: HashMap<Uuid, Run>,
    items: Vec<BatchItem>,
    libraries: HashMap<Uuid, Vec<Pose>>,
    library_errors: HashMap<Uuid, String>,
    outputs: HashMap<Uuid, Output>,
    /// Insertion order of outputs, for stable "oldest first" reads.
    output_order: Vec<Uuid>,
}

impl MemoryState {
    fn outputs_in_order(&self) -> impl Iterator<Item = &Output> {
        self.output_order
            .iter()
            .filter_map(move |id| self.outputs.get(id))
    }
}

/// Mutex-guarded in-process store.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    state: Mutex<MemoryState>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock only happens in a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn insert_batch(&self, batch: Batch) {
        self.lock().batches.insert(batch.id, batch);
    }

    pub fn insert_pipeline_job(&self, job: PipelineJob) {
        self.lock().jobs.insert(job.id, job);
    }

    pub fn insert_run(&self, run: Run) {
        self.lock().runs.insert(run.id, run);
    }

    pub fn insert_batch_item(&self, item: BatchItem) {
        self.lock().items.push(item);
    }

    /// Registers a brand library; an empty vector is a library with no poses.
    pub fn insert_library(&self, brand_id: Uuid, poses: Vec<Pose>) {
        self.lock().libraries.insert(brand_id, poses);
    }

    /// Makes every library read for `brand_id` fail with a query error.
    pub fn fail_library(&self, brand_id: Uuid, message: impl Into<String>) {
        self.lock().library_errors.insert(brand_id, message.into());
    }

    // =========================================================================
    // Inspection and external mutation
    // =========================================================================

    pub fn run(&self, run_id: Uuid) -> Option<Run> {
        self.lock().runs.get(&run_id).cloned()
    }

    pub fn output(&self, output_id: Uuid) -> Option<Output> {
        self.lock().outputs.get(&output_id).cloned()
    }

    pub fn batch(&self, batch_id: Uuid) -> Option<Batch> {
        self.lock().batches.get(&batch_id).cloned()
    }

    pub fn pipeline_job(&self, job_id: Uuid) -> Option<PipelineJob> {
        self.lock().jobs.get(&job_id).cloned()
    }

    /// Outputs of a batch in creation order.
    pub fn outputs_for_batch(&self, batch_id: Uuid) -> Vec<Output> {
        self.lock()
            .outputs_in_order()
            .filter(|o| o.batch_id == batch_id)
            .cloned()
            .collect()
    }

    pub fn outputs_for_run(&self, run_id: Uuid) -> Vec<Output> {
        self.lock()
            .outputs_in_order()
            .filter(|o| o.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Applies an arbitrary edit to a run, as another process would.
    pub fn update_run(&self, run_id: Uuid, edit: impl FnOnce(&mut Run)) {
        if let Some(run) = self.lock().runs.get_mut(&run_id) {
            edit(run);
        }
    }

    /// Applies an arbitrary edit to an output, as another process would.
    pub fn update_output(&self, output_id: Uuid, edit: impl FnOnce(&mut Output)) {
        if let Some(output) = self.lock().outputs.get_mut(&output_id) {
            edit(output);
        }
    }

    /// Sets a job status unconditionally, as the UI does when canceling.
    pub fn force_job_status(&self, job_id: Uuid, status: PipelineJobStatus) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.status = status;
            job.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError> {
        Ok(self.lock().batches.get(&batch_id).cloned())
    }

    async fn set_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("Batch {}", batch_id)))?;
        batch.status = status;
        Ok(())
    }

    async fn get_pipeline_job(&self, job_id: Uuid) -> Result<Option<PipelineJob>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("Pipeline job {}", job_id)))?;
        job.progress_done = progress.done;
        job.progress_failed = progress.failed;
        job.progress_total = progress.total;
        job.progress_message = Some(progress.message.clone());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        status: PipelineJobStatus,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("Pipeline job {}", job_id)))?;
        if job.status.halts_processing() {
            return Ok(false);
        }
        job.status = status;
        if let Some(message) = message {
            job.progress_message = Some(message.to_string());
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn reclaim_stale_runs(
        &self,
        batch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let mut reclaimed = 0;
        for run in state.runs.values_mut() {
            if run.batch_id == batch_id && run.is_stale(stale_before) {
                run.status = RunStatus::Queued;
                run.started_at = None;
                run.heartbeat_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn reclaim_stale_outputs(
        &self,
        batch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let mut reclaimed = 0;
        for output in state.outputs.values_mut() {
            if output.batch_id == batch_id && output.is_stale(stale_before) {
                output.status = OutputStatus::Queued;
                output.started_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn fetch_queued_runs(
        &self,
        batch_id: Uuid,
        limit: usize,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<Run>, StoreError> {
        let state = self.lock();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| {
                r.batch_id == batch_id && r.status == RunStatus::Queued && !exclude.contains(&r.id)
            })
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.created_at, r.id));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn claim_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Queued => {
                run.status = RunStatus::Running;
                run.started_at = Some(now);
                run.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = RunStatus::Queued;
                run.started_at = None;
                run.heartbeat_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = outcome.status;
                run.output_count = outcome.output_count;
                run.error_message = outcome.error_message.clone();
                run.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resettle_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.is_terminal() => {
                run.status = outcome.status;
                run.output_count = outcome.output_count;
                run.error_message = outcome.error_message.clone();
                run.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn batch_items_for_run(&self, run: &Run) -> Result<Vec<BatchItem>, StoreError> {
        Ok(self
            .lock()
            .items
            .iter()
            .filter(|item| item.batch_id == run.batch_id && item.belongs_to_look(run.look_id))
            .cloned()
            .collect())
    }

    async fn pose_library(&self, brand_id: Uuid) -> Result<Vec<Pose>, StoreError> {
        let state = self.lock();
        if let Some(message) = state.library_errors.get(&brand_id) {
            return Err(StoreError::QueryFailed(sqlx::Error::Protocol(message.clone())));
        }
        state
            .libraries
            .get(&brand_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Pose library for brand {}", brand_id)))
    }

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<Vec<Output>, StoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(outputs.len());
        for new in outputs {
            let duplicate = state.outputs.values().any(|o| {
                o.run_id == new.run_id
                    && o.batch_item_id == new.batch_item_id
                    && o.shot_type == new.shot_type
                    && o.pose_id == new.pose_id
                    && o.attempt_index == new.attempt_index
            });
            if duplicate {
                continue;
            }
            let output = Output {
                id: Uuid::new_v4(),
                batch_id: new.batch_id,
                run_id: new.run_id,
                batch_item_id: new.batch_item_id,
                pose_id: new.pose_id,
                pose_url: new.pose_url.clone(),
                shot_type: new.shot_type,
                attempt_index: new.attempt_index,
                status: OutputStatus::Queued,
                result_url: None,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            state.output_order.push(output.id);
            state.outputs.insert(output.id, output.clone());
            inserted.push(output);
        }
        Ok(inserted)
    }

    async fn queued_outputs_for_run(&self, run_id: Uuid) -> Result<Vec<Output>, StoreError> {
        Ok(self
            .lock()
            .outputs_in_order()
            .filter(|o| o.run_id == run_id && o.status == OutputStatus::Queued)
            .cloned()
            .collect())
    }

    async fn orphaned_outputs(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Output>, StoreError> {
        let state = self.lock();
        Ok(state
            .outputs_in_order()
            .filter(|o| o.batch_id == batch_id && o.status == OutputStatus::Queued)
            .filter(|o| {
                state
                    .runs
                    .get(&o.run_id)
                    .map(|r| r.status.is_terminal())
                    .unwrap_or(true)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_output(
        &self,
        output_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.outputs.get_mut(&output_id) {
            Some(output) if output.status == OutputStatus::Queued => {
                output.status = OutputStatus::Running;
                output.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_output(
        &self,
        output_id: Uuid,
        result_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.outputs.get_mut(&output_id) {
            Some(output) if output.status == OutputStatus::Running => {
                output.status = OutputStatus::Complete;
                output.result_url = result_url.map(str::to_string);
                output.error_message = None;
                output.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_output(
        &self,
        output_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.outputs.get_mut(&output_id) {
            Some(output) if output.status == OutputStatus::Running => {
                output.status = OutputStatus::Failed;
                output.error_message = Some(error.to_string());
                output.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_run_outputs(&self, run_id: Uuid) -> Result<OutputCounts, StoreError> {
        let state = self.lock();
        let mut counts = OutputCounts::default();
        for output in state.outputs.values().filter(|o| o.run_id == run_id) {
            counts.record(output.status);
        }
        Ok(counts)
    }

    async fn count_batch_outputs(&self, batch_id: Uuid) -> Result<OutputCounts, StoreError> {
        let state = self.lock();
        let mut counts = OutputCounts::default();
        for output in state.outputs.values().filter(|o| o.batch_id == batch_id) {
            counts.record(output.status);
        }
        Ok(counts)
    }
}
