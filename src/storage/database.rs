//! PostgreSQL implementation of [`BatchStore`].
//!
//! Every state transition is a single conditional `UPDATE ... WHERE status =`
//! so concurrent invocations never move a record backwards.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::scheduler::models::{
    Batch, BatchItem, BatchStatus, JobProgress, NewOutput, Output, OutputCounts, OutputStatus,
    PipelineJob, PipelineJobStatus, Pose, Run, RunConfig, RunOutcome,
};
use crate::scheduler::shot_type::{PoseSlot, ShotType};

use super::migrations::MigrationRunner;
use super::store::{BatchStore, StoreError};

const RUN_COLUMNS: &str = "id, batch_id, look_id, brand_id, product_type, config, status, \
     created_at, started_at, completed_at, heartbeat_at, output_count, error_message";

const OUTPUT_COLUMNS: &str = "id, batch_id, run_id, batch_item_id, pose_id, pose_url, shot_type, \
     attempt_index, status, result_url, error_message, created_at, started_at, completed_at";

/// PostgreSQL-backed batch store.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations, returning how many statements were applied.
    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let config: serde_json::Value = row.try_get("config")?;
    let config: RunConfig = if config.is_null() {
        RunConfig::default()
    } else {
        serde_json::from_value(config)?
    };
    let status: String = row.try_get("status")?;

    Ok(Run {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        look_id: row.try_get("look_id")?,
        brand_id: row.try_get("brand_id")?,
        product_type: row.try_get("product_type")?,
        config,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        output_count: row.try_get("output_count")?,
        error_message: row.try_get("error_message")?,
    })
}

fn output_from_row(row: &PgRow) -> Result<Output, StoreError> {
    let status: String = row.try_get("status")?;
    let shot_type: String = row.try_get("shot_type")?;

    Ok(Output {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        run_id: row.try_get("run_id")?,
        batch_item_id: row.try_get("batch_item_id")?,
        pose_id: row.try_get("pose_id")?,
        pose_url: row.try_get("pose_url")?,
        shot_type: shot_type
            .parse::<ShotType>()
            .map_err(StoreError::InvalidRecord)?,
        attempt_index: row.try_get("attempt_index")?,
        status: status.parse()?,
        result_url: row.try_get("result_url")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn pose_from_row(row: &PgRow) -> Result<Pose, StoreError> {
    let slot: Option<String> = row.try_get("slot")?;
    // Unrecognised slot letters leave the pose unslotted rather than failing
    // the whole library read.
    let slot = slot.and_then(|s| s.parse::<PoseSlot>().ok());
    let curation: String = row.try_get("curation_status")?;

    Ok(Pose {
        id: row.try_get("id")?,
        brand_id: row.try_get("brand_id")?,
        image_url: row.try_get("image_url")?,
        slot,
        product_type: row.try_get("product_type")?,
        curation_status: curation.parse()?,
    })
}

fn counts_from_rows(rows: &[PgRow]) -> Result<OutputCounts, StoreError> {
    let mut counts = OutputCounts::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        let n = n.max(0) as u64;
        match status.parse::<OutputStatus>()? {
            OutputStatus::Queued => counts.queued += n,
            OutputStatus::Running => counts.running += n,
            OutputStatus::Complete => counts.complete += n,
            OutputStatus::Failed => counts.failed += n,
        }
    }
    Ok(counts)
}

#[async_trait]
impl BatchStore for PgBatchStore {
    // =========================================================================
    // Batches and pipeline jobs
    // =========================================================================

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query("SELECT id, status, pipeline_job_id, created_at FROM batches WHERE id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let status: String = row.try_get("status")?;
        Ok(Some(Batch {
            id: row.try_get("id")?,
            status: status.parse()?,
            pipeline_job_id: row.try_get("pipeline_job_id")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn set_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE batches SET status = $2 WHERE id = $1")
            .bind(batch_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Batch {}", batch_id)));
        }
        Ok(())
    }

    async fn get_pipeline_job(&self, job_id: Uuid) -> Result<Option<PipelineJob>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, progress_done, progress_failed, progress_total,
                   progress_message, updated_at
            FROM pipeline_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let status: String = row.try_get("status")?;
        Ok(Some(PipelineJob {
            id: row.try_get("id")?,
            status: status.parse()?,
            progress_done: row.try_get("progress_done")?,
            progress_failed: row.try_get("progress_failed")?,
            progress_total: row.try_get("progress_total")?,
            progress_message: row.try_get("progress_message")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET progress_done = $2, progress_failed = $3, progress_total = $4,
                progress_message = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(progress.done)
        .bind(progress.failed)
        .bind(progress.total)
        .bind(&progress.message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Pipeline job {}", job_id)));
        }
        Ok(())
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        status: PipelineJobStatus,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = $2,
                progress_message = COALESCE($3, progress_message),
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('CANCELED', 'PAUSED')
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    async fn reclaim_stale_runs(
        &self,
        batch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'queued', started_at = NULL, heartbeat_at = NULL
            WHERE batch_id = $1
              AND status = 'running'
              AND (heartbeat_at IS NULL OR heartbeat_at < $2)
            "#,
        )
        .bind(batch_id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_stale_outputs(
        &self,
        batch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outputs
            SET status = 'queued', started_at = NULL
            WHERE batch_id = $1
              AND status = 'running'
              AND COALESCE(started_at, created_at) < $2
            "#,
        )
        .bind(batch_id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn fetch_queued_runs(
        &self,
        batch_id: Uuid,
        limit: usize,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<Run>, StoreError> {
        let excluded: Vec<Uuid> = exclude.iter().copied().collect();
        let sql = format!(
            r#"
            SELECT {}
            FROM runs
            WHERE batch_id = $1 AND status = 'queued' AND NOT (id = ANY($2))
            ORDER BY created_at, id
            LIMIT $3
            "#,
            RUN_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .bind(&excluded)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn claim_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = $2, heartbeat_at = $2
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(run_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE runs SET heartbeat_at = $2 WHERE id = $1 AND status = 'running'")
                .bind(run_id)
                .bind(now)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'queued', started_at = NULL, heartbeat_at = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, output_count = $3, error_message = $4, completed_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(outcome.status.as_str())
        .bind(outcome.output_count)
        .bind(outcome.error_message.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resettle_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, output_count = $3, error_message = $4, completed_at = $5
            WHERE id = $1 AND status IN ('complete', 'failed')
            "#,
        )
        .bind(run_id)
        .bind(outcome.status.as_str())
        .bind(outcome.output_count)
        .bind(outcome.error_message.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Expansion inputs
    // =========================================================================

    async fn batch_items_for_run(&self, run: &Run) -> Result<Vec<BatchItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bi.id, bi.batch_id, bi.look_id, gj.look_id AS linked_look_id,
                   bi.view, bi.source_url
            FROM batch_items bi
            LEFT JOIN job_outputs jo ON jo.id = bi.source_output_id
            LEFT JOIN generation_jobs gj ON gj.id = jo.job_id
            WHERE bi.batch_id = $1 AND (bi.look_id = $2 OR gj.look_id = $2)
            ORDER BY bi.created_at, bi.id
            "#,
        )
        .bind(run.batch_id)
        .bind(run.look_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BatchItem {
                    id: row.try_get("id")?,
                    batch_id: row.try_get("batch_id")?,
                    look_id: row.try_get("look_id")?,
                    linked_look_id: row.try_get("linked_look_id")?,
                    view: row.try_get("view")?,
                    source_url: row.try_get("source_url")?,
                })
            })
            .collect()
    }

    async fn pose_library(&self, brand_id: Uuid) -> Result<Vec<Pose>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, brand_id, image_url, slot, product_type, curation_status
            FROM poses
            WHERE brand_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(brand_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::NotFound(format!(
                "Pose library for brand {}",
                brand_id
            )));
        }

        rows.iter().map(pose_from_row).collect()
    }

    // =========================================================================
    // Outputs
    // =========================================================================

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<Vec<Output>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"
            INSERT INTO outputs (
                id, batch_id, run_id, batch_item_id, pose_id, pose_url,
                shot_type, attempt_index, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued')
            ON CONFLICT (run_id, batch_item_id, shot_type, pose_id, attempt_index) DO NOTHING
            RETURNING {}
            "#,
            OUTPUT_COLUMNS
        );

        let mut inserted = Vec::with_capacity(outputs.len());
        for output in outputs {
            let row = sqlx::query(&sql)
                .bind(Uuid::new_v4())
                .bind(output.batch_id)
                .bind(output.run_id)
                .bind(output.batch_item_id)
                .bind(output.pose_id)
                .bind(&output.pose_url)
                .bind(output.shot_type.as_str())
                .bind(output.attempt_index)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(row) = row {
                inserted.push(output_from_row(&row)?);
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn queued_outputs_for_run(&self, run_id: Uuid) -> Result<Vec<Output>, StoreError> {
        let sql = format!(
            "SELECT {} FROM outputs WHERE run_id = $1 AND status = 'queued' ORDER BY created_at, id",
            OUTPUT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(output_from_row).collect()
    }

    async fn orphaned_outputs(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Output>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM outputs o
            WHERE o.batch_id = $1
              AND o.status = 'queued'
              AND NOT EXISTS (
                  SELECT 1 FROM runs r
                  WHERE r.id = o.run_id AND r.status IN ('queued', 'running')
              )
            ORDER BY o.created_at, o.id
            LIMIT $2
            "#,
            OUTPUT_COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(output_from_row).collect()
    }

    async fn claim_output(
        &self,
        output_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outputs SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'queued'",
        )
        .bind(output_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_output(
        &self,
        output_id: Uuid,
        result_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outputs
            SET status = 'complete', result_url = $2, error_message = NULL, completed_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(output_id)
        .bind(result_url)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_output(
        &self,
        output_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outputs
            SET status = 'failed', error_message = $2, completed_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(output_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_run_outputs(&self, run_id: Uuid) -> Result<OutputCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM outputs WHERE run_id = $1 GROUP BY status",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        counts_from_rows(&rows)
    }

    async fn count_batch_outputs(&self, batch_id: Uuid) -> Result<OutputCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM outputs WHERE batch_id = $1 GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        counts_from_rows(&rows)
    }
}
