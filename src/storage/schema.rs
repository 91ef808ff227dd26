//! Database schema constants.
//!
//! Pipeline jobs, generation jobs and poses are owned by other services;
//! their tables are created here so a fresh database is usable end to end.

/// SQL schema for creating the pipeline_jobs table.
pub const CREATE_PIPELINE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_jobs (
    id UUID PRIMARY KEY,
    status VARCHAR(32) NOT NULL DEFAULT 'RUNNING',
    progress_done INTEGER NOT NULL DEFAULT 0,
    progress_failed INTEGER NOT NULL DEFAULT 0,
    progress_total INTEGER NOT NULL DEFAULT 0,
    progress_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the batches table.
pub const CREATE_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id UUID PRIMARY KEY,
    status VARCHAR(32) NOT NULL DEFAULT 'RUNNING',
    pipeline_job_id UUID REFERENCES pipeline_jobs(id) ON DELETE SET NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the runs table.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    look_id UUID NOT NULL,
    brand_id UUID NOT NULL,
    product_type VARCHAR(64),
    config JSONB NOT NULL DEFAULT '{}'::jsonb,
    status VARCHAR(16) NOT NULL DEFAULT 'queued',
    output_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    heartbeat_at TIMESTAMPTZ
)
"#;

/// SQL schema for creating the generation_jobs table.
pub const CREATE_GENERATION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS generation_jobs (
    id UUID PRIMARY KEY,
    look_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the job_outputs table.
pub const CREATE_JOB_OUTPUTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_outputs (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES generation_jobs(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the batch_items table.
pub const CREATE_BATCH_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batch_items (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    look_id UUID,
    source_output_id UUID REFERENCES job_outputs(id) ON DELETE SET NULL,
    view VARCHAR(64),
    source_url TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the poses table.
pub const CREATE_POSES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS poses (
    id UUID PRIMARY KEY,
    brand_id UUID NOT NULL,
    image_url TEXT NOT NULL,
    slot VARCHAR(4),
    product_type VARCHAR(64),
    curation_status VARCHAR(16) NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the outputs table.
///
/// The unique key makes re-expansion of a run a no-op.
pub const CREATE_OUTPUTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outputs (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    run_id UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    batch_item_id UUID NOT NULL REFERENCES batch_items(id) ON DELETE CASCADE,
    pose_id UUID NOT NULL,
    pose_url TEXT NOT NULL,
    shot_type VARCHAR(32) NOT NULL,
    attempt_index INTEGER NOT NULL DEFAULT 0,
    status VARCHAR(16) NOT NULL DEFAULT 'queued',
    result_url TEXT,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    UNIQUE(run_id, batch_item_id, shot_type, pose_id, attempt_index)
)
"#;

/// Index creation statements, one per statement so each runs as its own
/// prepared query.
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_runs_batch_status ON runs(batch_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_outputs_run_status ON outputs(run_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_outputs_batch_status ON outputs(batch_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_batch_items_batch ON batch_items(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_poses_brand ON poses(brand_id)",
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_PIPELINE_JOBS_TABLE,
        CREATE_BATCHES_TABLE,
        CREATE_RUNS_TABLE,
        CREATE_GENERATION_JOBS_TABLE,
        CREATE_JOB_OUTPUTS_TABLE,
        CREATE_BATCH_ITEMS_TABLE,
        CREATE_POSES_TABLE,
        CREATE_OUTPUTS_TABLE,
    ];
    statements.extend_from_slice(CREATE_INDEXES);
    statements
}
