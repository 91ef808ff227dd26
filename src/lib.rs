//! repose-forge: batch run processor for clay-pose image generation.
//!
//! A batch is a set of runs, one per look. Each invocation of the processor
//! reclaims stalled work, expands queued runs into per-pose outputs, drives
//! those through an external generator with bounded concurrency, and hands
//! itself off through a durable queue before its time budget expires.

pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, ProcessorConfig};
pub use error::{GenerationError, ProcessorError, SubmitError};
pub use scheduler::{BatchProcessor, InvocationOutcome, ProcessRequest, ResumeContext};
pub use storage::{BatchStore, StoreError};
