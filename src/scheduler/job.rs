//! Invocation payloads carried through the continuation queue.
//!
//! - `ProcessRequest`: what one processor invocation works on
//! - `ResumeContext`: state carried from one invocation to the next
//! - `InvocationTicket`: the queued envelope with retry bookkeeping

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of times a ticket is attempted before it is
/// dead-lettered.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// State handed from one invocation to its continuation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeContext {
    /// Runs already settled by earlier invocations of this chain.
    #[serde(default)]
    pub processed_run_ids: BTreeSet<Uuid>,
    /// Number of continuations that led to this invocation.
    #[serde(default)]
    pub continuation_depth: u32,
}

impl ResumeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, run_id: &Uuid) -> bool {
        self.processed_run_ids.contains(run_id)
    }

    /// Context for the next invocation in the chain.
    pub fn next(&self, processed: impl IntoIterator<Item = Uuid>) -> Self {
        let mut processed_run_ids = self.processed_run_ids.clone();
        processed_run_ids.extend(processed);
        Self {
            processed_run_ids,
            continuation_depth: self.continuation_depth + 1,
        }
    }
}

/// One processor invocation's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub batch_id: Uuid,
    pub pipeline_job_id: Uuid,
    pub model: String,
    #[serde(default)]
    pub resume_context: ResumeContext,
}

impl ProcessRequest {
    pub fn new(batch_id: Uuid, pipeline_job_id: Uuid, model: impl Into<String>) -> Self {
        Self {
            batch_id,
            pipeline_job_id,
            model: model.into(),
            resume_context: ResumeContext::default(),
        }
    }

    pub fn with_resume_context(mut self, context: ResumeContext) -> Self {
        self.resume_context = context;
        self
    }

    /// The request a self-continuation dispatches.
    pub fn continuation(&self, processed: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            batch_id: self.batch_id,
            pipeline_job_id: self.pipeline_job_id,
            model: self.model.clone(),
            resume_context: self.resume_context.next(processed),
        }
    }
}

/// A queued invocation.
///
/// Attempts count infrastructure failures of the invocation itself
/// (store outages, crashes); per-output retries are handled inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationTicket {
    pub id: Uuid,
    pub request: ProcessRequest,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl InvocationTicket {
    pub fn new(request: ProcessRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Increments the attempt counter.
    ///
    /// This should be called before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long ago the ticket was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
