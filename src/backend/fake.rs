//! Scripted backend and model handles for unit tests.

use super::{BackendError, GenerateRequest, InferenceBackend};
use crate::resources::{
    Capability, Device, MemoryGauge, ModelHandle, ModelSpec, ResourceEstimator,
    tokenize::whitespace_counter,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

type Responder = Box<dyn Fn(&GenerateRequest) -> Result<String, BackendError> + Send + Sync>;

pub(crate) struct FakeBackend {
    responder: Responder,
    prompts: Mutex<Vec<String>>,
    embedded: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<String, BackendError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            prompts: Mutex::new(Vec::new()),
            embedded: Mutex::new(Vec::new()),
        }
    }

    /// Answers every prompt with the same text.
    pub(crate) fn constant(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_| Ok(reply.clone()))
    }

    /// Answers with a digest of the prompt so different inputs give different summaries.
    pub(crate) fn digest() -> Self {
        Self::new(|request| {
            Ok(format!(
                "digest of a {} word prompt",
                request.prompt.split_whitespace().count()
            ))
        })
    }

    pub(crate) fn failing() -> Self {
        Self::new(|_| Err(BackendError::RequestFailed("scripted failure".into())))
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub(crate) fn generate_calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }

    pub(crate) fn embedded(&self) -> Vec<String> {
        self.embedded.lock().expect("embedded lock").clone()
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<String, BackendError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        (self.responder)(&request)
    }

    async fn embed(&self, _model: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>, BackendError> {
        let vectors = texts
            .iter()
            .map(|text| vec![text.len() as f32, 1.0])
            .collect();
        self.embedded.lock().expect("embedded lock").extend(texts);
        Ok(vectors)
    }
}

pub(crate) struct UnknownMemory;

impl MemoryGauge for UnknownMemory {
    fn available_bytes(&self) -> Option<u64> {
        None
    }
}

/// Estimator that always yields the model's declared limit.
pub(crate) fn declared_limit_estimator() -> ResourceEstimator {
    ResourceEstimator::new(Arc::new(UnknownMemory), 2048, 0)
}

/// Handle counting whitespace-delimited words as tokens.
pub(crate) fn model(capability: Capability, max_input_tokens: usize) -> Arc<ModelHandle> {
    Arc::new(ModelHandle::new(
        &ModelSpec::default_for(capability),
        PathBuf::from("/tmp/rusty-digest-test-model"),
        Device::Cpu,
        max_input_tokens,
        whitespace_counter(),
    ))
}
