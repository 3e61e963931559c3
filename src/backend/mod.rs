//! Inference backend abstraction.
//!
//! The pipeline never runs models itself: it hands prompts and texts to an [`InferenceBackend`]
//! addressed by the serving name of a resolved [`ModelHandle`]. Tokenization stays local so that
//! budgets are computed before anything crosses the wire.

#[cfg(test)]
pub(crate) mod fake;
mod ollama;

use crate::resources::ModelHandle;
use async_trait::async_trait;
use thiserror::Error;

pub use ollama::OllamaBackend;

/// Errors surfaced by inference backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend was unreachable or does not serve the model.
    #[error("Inference backend unavailable: {0}")]
    Unavailable(String),
    /// Backend returned an error response.
    #[error("Inference request failed: {0}")]
    RequestFailed(String),
    /// Backend response could not be parsed.
    #[error("Malformed backend response: {0}")]
    InvalidResponse(String),
}

/// Text generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Model name understood by the backend.
    pub model: String,
    /// Full prompt.
    pub prompt: String,
    /// Upper bound on generated tokens.
    pub max_output_tokens: usize,
    /// Lower bound on generated tokens (advisory; not every backend enforces it).
    pub min_output_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether the model may use an accelerator.
    pub use_accelerator: bool,
}

impl GenerateRequest {
    /// Build a request for `model` with its declared output bounds.
    pub fn for_model(model: &ModelHandle, prompt: String, temperature: f32) -> Self {
        Self {
            model: model.serving_name.clone(),
            prompt,
            max_output_tokens: model.max_output_tokens,
            min_output_tokens: model.min_output_tokens,
            temperature,
            use_accelerator: model.device.is_accelerator(),
        }
    }
}

/// Generate and embed primitives offered by a model runtime.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Generate a completion for the request.
    async fn generate(&self, request: GenerateRequest) -> Result<String, BackendError>;

    /// Produce one embedding vector per input text, in order.
    async fn embed(&self, model: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>, BackendError>;
}
