//! The "generate one output" capability.
//!
//! The processor treats image generation as an opaque collaborator: given an
//! output record and a model identifier it either produces a stored result
//! or fails. Prompt construction and provider choice live behind the
//! service this trait talks to.

pub mod client;

use async_trait::async_trait;

use crate::error::GenerationError;
use crate::scheduler::models::Output;

pub use client::HttpOutputGenerator;

/// A successfully generated output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedOutput {
    /// Where the generated image was stored, when the service reports it.
    pub result_url: Option<String>,
}

impl GeneratedOutput {
    pub fn stored_at(url: impl Into<String>) -> Self {
        Self {
            result_url: Some(url.into()),
        }
    }
}

/// Produces the image for one output.
#[async_trait]
pub trait OutputGenerator: Send + Sync {
    async fn generate(&self, output: &Output, model: &str)
        -> Result<GeneratedOutput, GenerationError>;
}
