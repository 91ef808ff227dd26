//! Batch run processing: sweep, expand, execute, continue.
//!
//! - **LivenessSweeper**: reclaims runs and outputs abandoned by a killed invocation
//! - **RunExpander**: fans a run out into outputs, one per selected pose and shot type
//! - **OutputExecutor**: drives outputs through the generator with bounded concurrency
//! - **BatchProcessor**: one time-bounded invocation that self-continues via the queue
//! - **InvocationQueue / WorkerPool**: durable continuation and the workers consuming it
//! - **Submitter**: entry point that validates a request and queues its first invocation
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Submitter   │
//!                      │  (CLI/API)   │
//!                      └──────┬───────┘
//!                             │ ticket
//!                      ┌──────▼───────┐
//!             ┌───────►│    Redis     │
//!             │        │    Queue     │
//!             │        └──────┬───────┘
//!  continuation│               │
//!             │     ┌─────────┼─────────┐
//!             │     ▼         ▼         ▼
//!             │ ┌────────┐┌────────┐┌────────┐
//!             └─┤Worker 1││Worker 2││Worker N│
//!               └───┬────┘└───┬────┘└───┬────┘
//!                   └─────────┼─────────┘
//!                     ┌───────▼───────┐
//!                     │ BatchProcessor│──► BatchStore (Postgres)
//!                     └───────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use repose_forge::scheduler::{BatchProcessor, InvocationQueue, ProcessRequest};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(InvocationQueue::connect(&config.redis_url, &config.queue_name).await?);
//! let processor = BatchProcessor::new(store, generator, queue, config);
//!
//! let outcome = processor
//!     .process(&ProcessRequest::new(batch_id, pipeline_job_id, "nano-banana"))
//!     .await?;
//! ```

pub mod executor;
pub mod expander;
pub mod job;
pub mod models;
pub mod processor;
pub mod queue;
pub mod shot_type;
pub mod submit;
pub mod sweeper;
pub mod worker_pool;

// Re-export main types for convenience
pub use executor::{ExecutorSettings, OutputExecutor, RunExecution, SliceReport};
pub use expander::{eligible_poses, Expansion, RunExpander};
pub use job::{InvocationTicket, ProcessRequest, ResumeContext};
pub use models::{
    Batch, BatchItem, BatchStatus, CurationStatus, NewOutput, Output, OutputCounts, OutputStatus,
    PipelineJob, PipelineJobStatus, Pose, ProductType, Run, RunConfig, RunOutcome, RunStatus,
};
pub use processor::{BatchProcessor, InvocationOutcome, Phase};
pub use queue::{ContinuationSink, InvocationQueue, QueueError, QueueStats};
pub use shot_type::{classify_view, PoseSlot, ShotType, ViewClass};
pub use submit::{SubmitPayload, SubmitResponse, Submitter};
pub use sweeper::{LivenessSweeper, SweepReport};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};
