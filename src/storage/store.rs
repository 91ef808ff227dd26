//! The `BatchStore` trait: every durable read and write the processor makes.
//!
//! All liveness and progress state lives in the store, never in memory, so a
//! killed invocation can be resumed by a fresh process. Writes are guarded by
//! the status the caller expects the record to be in ("update ... where
//! status = running") and report whether they applied. Two invocations racing
//! on the same record therefore converge: one wins, the other sees `false`.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::models::{
    Batch, BatchItem, BatchStatus, JobProgress, NewOutput, Output, OutputCounts, PipelineJob,
    PipelineJobStatus, Pose, Run, RunOutcome, UnknownStatus,
};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backing store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A persisted value could not be decoded.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

impl From<UnknownStatus> for StoreError {
    fn from(err: UnknownStatus) -> Self {
        StoreError::InvalidRecord(err.to_string())
    }
}

/// Durable access to batches, runs, outputs and pipeline jobs.
#[async_trait]
pub trait BatchStore: Send + Sync {
    // =========================================================================
    // Batches and pipeline jobs
    // =========================================================================

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError>;

    async fn set_batch_status(&self, batch_id: Uuid, status: BatchStatus)
        -> Result<(), StoreError>;

    async fn get_pipeline_job(&self, job_id: Uuid) -> Result<Option<PipelineJob>, StoreError>;

    /// Writes progress counters and message without touching the status.
    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
    ) -> Result<(), StoreError>;

    /// Sets the job status, unless the job was canceled or paused meanwhile.
    ///
    /// Returns whether the write applied.
    async fn set_job_status(
        &self,
        job_id: Uuid,
        status: PipelineJobStatus,
        message: Option<&str>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Resets `running` runs whose heartbeat is older than `stale_before`,
    /// or missing, to `queued` and clears `started_at` / `heartbeat_at`.
    async fn reclaim_stale_runs(
        &self,
        batch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Resets `running` outputs whose last activity is older than
    /// `stale_before` to `queued`.
    async fn reclaim_stale_outputs(
        &self,
        batch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    /// Queued runs oldest first, skipping `exclude`.
    async fn fetch_queued_runs(
        &self,
        batch_id: Uuid,
        limit: usize,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<Run>, StoreError>;

    /// `queued` -> `running`, stamping `started_at` and `heartbeat_at`.
    async fn claim_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Refreshes `heartbeat_at` of a `running` run.
    async fn heartbeat_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// `running` -> `queued`, clearing `started_at` / `heartbeat_at`.
    async fn release_run(&self, run_id: Uuid) -> Result<bool, StoreError>;

    /// `running` -> terminal.
    async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Recomputes the terminal state of an already terminal run.
    async fn resettle_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Expansion inputs
    // =========================================================================

    /// Batch items mapped to the run's look directly or via output -> job -> look.
    async fn batch_items_for_run(&self, run: &Run) -> Result<Vec<BatchItem>, StoreError>;

    /// Poses of the brand's library. `NotFound` when the brand has no library.
    async fn pose_library(&self, brand_id: Uuid) -> Result<Vec<Pose>, StoreError>;

    // =========================================================================
    // Outputs
    // =========================================================================

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<Vec<Output>, StoreError>;

    async fn queued_outputs_for_run(&self, run_id: Uuid) -> Result<Vec<Output>, StoreError>;

    /// Queued outputs whose run is already terminal, oldest first.
    async fn orphaned_outputs(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Output>, StoreError>;

    /// `queued` -> `running`.
    async fn claim_output(&self, output_id: Uuid, now: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// `running` -> `complete`.
    async fn complete_output(
        &self,
        output_id: Uuid,
        result_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `running` -> `failed`.
    async fn fail_output(
        &self,
        output_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn count_run_outputs(&self, run_id: Uuid) -> Result<OutputCounts, StoreError>;

    async fn count_batch_outputs(&self, batch_id: Uuid) -> Result<OutputCounts, StoreError>;
}
