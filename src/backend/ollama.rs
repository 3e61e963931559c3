//! Ollama-compatible HTTP backend.

use super::{BackendError, GenerateRequest, InferenceBackend};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Backend that issues requests directly to an Ollama runtime.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    http: Client,
    base_url: String,
}

impl OllamaBackend {
    /// Create a backend for `base_url` with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let http = Client::builder()
            .user_agent("rusty-digest/inference")
            .timeout(timeout)
            .build()
            .map_err(|error| {
                BackendError::Unavailable(format!("failed to build HTTP client: {error}"))
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<reqwest::Response, BackendError> {
        let endpoint = self.endpoint(path);
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                BackendError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(format!(
                "Ollama endpoint {endpoint} returned 404: {body}"
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::RequestFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<String, BackendError> {
        let mut options = json!({
            "temperature": request.temperature,
            "num_predict": request.max_output_tokens,
        });
        if !request.use_accelerator {
            options["num_gpu"] = json!(0);
        }
        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": options,
        });

        let body: GenerateResponse = self
            .post("generate", payload)
            .await?
            .json()
            .await
            .map_err(|error| {
                BackendError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
            })?;

        if !body.done {
            return Err(BackendError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response.trim().to_string())
    }

    async fn embed(&self, model: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();
        let payload = json!({
            "model": model,
            "input": texts,
        });

        let body: EmbedResponse = self
            .post("embed", payload)
            .await?
            .json()
            .await
            .map_err(|error| {
                BackendError::InvalidResponse(format!(
                    "failed to decode Ollama embeddings: {error}"
                ))
            })?;

        if body.embeddings.len() != expected {
            return Err(BackendError::InvalidResponse(format!(
                "expected {expected} embeddings, got {}",
                body.embeddings.len()
            )));
        }

        Ok(body.embeddings)
    }
}
