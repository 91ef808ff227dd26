//! Entry point: validates a processing request and queues its first
//! invocation.
//!
//! Submission returns as soon as the ticket is queued. Progress is observed
//! through the pipeline job record, not through this call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::SubmitError;

use super::job::{ProcessRequest, ResumeContext};
use super::queue::ContinuationSink;

/// Raw request body. Ids arrive as strings and are validated here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload {
    pub batch_id: Option<String>,
    pub pipeline_job_id: Option<String>,
    pub model: Option<String>,
    pub resume_context: Option<ResumeContext>,
}

impl SubmitPayload {
    pub fn new(batch_id: Uuid, pipeline_job_id: Uuid) -> Self {
        Self {
            batch_id: Some(batch_id.to_string()),
            pipeline_job_id: Some(pipeline_job_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub pipeline_job_id: Uuid,
}

pub struct Submitter {
    sink: Arc<dyn ContinuationSink>,
    default_model: String,
}

impl Submitter {
    pub fn new(sink: Arc<dyn ContinuationSink>, default_model: impl Into<String>) -> Self {
        Self {
            sink,
            default_model: default_model.into(),
        }
    }

    /// Validates `payload` into a request without queueing it.
    pub fn validate(&self, payload: SubmitPayload) -> Result<ProcessRequest, SubmitError> {
        let batch_id = parse_id("batchId", payload.batch_id.as_deref())?;
        let pipeline_job_id = parse_id("pipelineJobId", payload.pipeline_job_id.as_deref())?;
        let model = payload
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        Ok(ProcessRequest::new(batch_id, pipeline_job_id, model)
            .with_resume_context(payload.resume_context.unwrap_or_default()))
    }

    /// Queues the first invocation and returns immediately.
    pub async fn submit(&self, payload: SubmitPayload) -> Result<SubmitResponse, SubmitError> {
        let request = self.validate(payload)?;
        let pipeline_job_id = request.pipeline_job_id;

        info!(
            batch_id = %request.batch_id,
            pipeline_job_id = %pipeline_job_id,
            model = %request.model,
            "Submitting batch for processing"
        );
        self.sink.dispatch(request).await?;

        Ok(SubmitResponse {
            success: true,
            pipeline_job_id,
        })
    }
}

fn parse_id(field: &'static str, value: Option<&str>) -> Result<Uuid, SubmitError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(SubmitError::MissingField(field))?;
    Uuid::parse_str(value).map_err(|e| SubmitError::InvalidField {
        field,
        message: e.to_string(),
    })
}
