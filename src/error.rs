//! Error types for batch processing.
//!
//! Storage, queue, config and pool errors live next to their subsystems;
//! this module holds the errors of the processing pipeline itself:
//! - Generation calls to the external image service
//! - Run expansion into outputs
//! - The per-invocation controller
//! - The submit entry point

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::queue::QueueError;
use crate::storage::StoreError;

/// Errors returned by a single "generate one output" call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generator returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Generator request failed: {0}")]
    RequestFailed(String),

    #[error("Generator request timed out")]
    Timeout,

    #[error("Failed to parse generator response: {0}")]
    InvalidResponse(String),

    #[error("Generation rejected: {0}")]
    Rejected(String),

    #[error("Generator is not configured: {0}")]
    NotConfigured(String),
}

impl GenerationError {
    /// Whether the failure looks like a transient gateway problem worth
    /// retrying: HTTP 503/504 or their reason phrases anywhere in the text.
    pub fn is_retryable(&self) -> bool {
        if let GenerationError::Http { status, .. } = self {
            if *status == 503 || *status == 504 {
                return true;
            }
        }
        let text = self.to_string().to_ascii_lowercase();
        text.contains("service unavailable") || text.contains("gateway timeout")
    }
}

/// Errors raised while expanding a run. Each one fails only that run.
#[derive(Debug, Error)]
pub enum ExpansionError {
    #[error("Pose library lookup failed for brand {brand_id}: {reason}")]
    LibraryUnavailable { brand_id: Uuid, reason: String },

    #[error("No usable poses in library for brand {0}")]
    NoPoses(Uuid),

    #[error("No poses in library for brand {0} match any requested shot type")]
    NoEligiblePoses(Uuid),
}

/// Errors that abort a processor invocation.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Batch {0} not found")]
    BatchNotFound(Uuid),

    #[error("Pipeline job {0} not found")]
    PipelineJobNotFound(Uuid),

    #[error("Continuation limit of {0} reached")]
    ContinuationLimit(u32),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Continuation dispatch failed: {0}")]
    Continuation(#[from] QueueError),
}

impl ProcessorError {
    /// Whether running the same invocation again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessorError::Store(_) | ProcessorError::Continuation(_)
        )
    }
}

/// Errors returned to callers of the submit entry point.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("Failed to enqueue invocation: {0}")]
    Queue(#[from] QueueError),
}

impl SubmitError {
    /// Whether the caller sent a bad request, as opposed to a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SubmitError::MissingField(_) | SubmitError::InvalidField { .. }
        )
    }
}
