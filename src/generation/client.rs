//! HTTP client for the image generation service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProcessorConfig;
use crate::error::GenerationError;
use crate::scheduler::models::Output;

use super::{GeneratedOutput, OutputGenerator};

/// Request body sent to the generation endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    output_id: String,
    model: &'a str,
    pose_url: &'a str,
    shot_type: &'a str,
}

/// Response body of the generation endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Calls a single-output generation endpoint over HTTP.
///
/// One call per attempt; retries are the executor's job.
pub struct HttpOutputGenerator {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOutputGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::NotConfigured(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Builds a client from the processor configuration.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::NotConfigured` if no generator URL is set.
    pub fn from_config(config: &ProcessorConfig) -> Result<Self, GenerationError> {
        let endpoint = config.generator_url.clone().ok_or_else(|| {
            GenerationError::NotConfigured("REPOSE_GENERATOR_URL is not set".to_string())
        })?;
        Self::new(
            endpoint,
            config.generator_api_key.clone(),
            config.generator_timeout,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OutputGenerator for HttpOutputGenerator {
    async fn generate(
        &self,
        output: &Output,
        model: &str,
    ) -> Result<GeneratedOutput, GenerationError> {
        let body = GenerateRequest {
            output_id: output.id.to_string(),
            model,
            pose_url: &output.pose_url,
            shot_type: output.shot_type.as_str(),
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(GenerationError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        parse_response(&text)
    }
}

/// Interprets a 2xx body. Empty bodies count as success without a URL.
fn parse_response(text: &str) -> Result<GeneratedOutput, GenerationError> {
    if text.trim().is_empty() {
        return Ok(GeneratedOutput::default());
    }

    let parsed: GenerateResponse = serde_json::from_str(text)
        .map_err(|e| GenerationError::InvalidResponse(format!("{}: {}", e, text)))?;

    if let Some(error) = parsed.error {
        return Err(GenerationError::Rejected(error));
    }
    if parsed.success == Some(false) {
        return Err(GenerationError::Rejected(
            "generator reported failure".to_string(),
        ));
    }

    Ok(GeneratedOutput {
        result_url: parsed.result_url,
    })
}
