//! Model resolution and host resource estimation.
//!
//! Models go through two phases: a [`ModelSpec`] is declared from configuration (pure data), and
//! [`ModelRegistry::resolve`] turns it into a cached, device-placed [`ModelHandle`] exactly once
//! per process. [`ResourceEstimator`] combines a handle's declared input limit with the memory the
//! host can spare to produce the token budget used by the chunker and summarizer.

mod cache;
mod device;
mod estimator;
mod registry;
pub mod tokenize;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use cache::{CachedModel, ModelCache};
pub use device::{Device, DeviceDetector, HostDevices, device_for};
pub use estimator::{MemoryBudget, MemoryGauge, ResourceEstimator, SystemMemory};
pub use registry::{ModelHandle, ModelRegistry};
pub use tokenize::TokenCounter;

/// Inference capabilities the pipeline relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Abstractive summarization.
    Summarizer,
    /// Document type classification.
    Classifier,
    /// Text embeddings for tree nodes.
    Embedder,
}

impl Capability {
    /// Every capability, in resolution order.
    pub const ALL: [Capability; 3] = [
        Capability::Summarizer,
        Capability::Classifier,
        Capability::Embedder,
    ];

    /// Prefix of the environment variables that configure this capability.
    pub fn env_prefix(self) -> &'static str {
        match self {
            Capability::Summarizer => "SUMMARIZER",
            Capability::Classifier => "CLASSIFIER",
            Capability::Embedder => "EMBEDDER",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Summarizer => "summarizer",
            Capability::Classifier => "classifier",
            Capability::Embedder => "embedder",
        };
        f.write_str(name)
    }
}

/// Declared model for a capability, before anything is downloaded or placed.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    /// Capability served by this model.
    pub capability: Capability,
    /// Hub repository id (`owner/name`) used for the local cache.
    pub repo: String,
    /// Model name understood by the inference backend.
    pub serving_name: String,
    /// Overrides the input length declared by the model configuration.
    pub max_input_tokens: Option<usize>,
    /// Upper bound on generated tokens.
    pub max_output_tokens: usize,
    /// Lower bound on generated tokens.
    pub min_output_tokens: usize,
    /// Characters-per-token heuristic used for character budgets.
    pub chars_per_token: usize,
    /// Accelerators to try, in order.
    pub device_priority: Vec<Device>,
}

impl ModelSpec {
    /// Built-in defaults for a capability.
    pub fn default_for(capability: Capability) -> Self {
        let (repo, serving_name, max_input_tokens, max_output_tokens, min_output_tokens) =
            match capability {
                Capability::Summarizer => (
                    "Qwen/Qwen2.5-1.5B-Instruct",
                    "qwen2.5:1.5b",
                    None,
                    256,
                    32,
                ),
                Capability::Classifier => (
                    "Qwen/Qwen2.5-0.5B-Instruct",
                    "qwen2.5:0.5b",
                    Some(1024),
                    16,
                    1,
                ),
                Capability::Embedder => (
                    "sentence-transformers/all-MiniLM-L6-v2",
                    "all-minilm",
                    None,
                    0,
                    0,
                ),
            };
        Self {
            capability,
            repo: repo.to_string(),
            serving_name: serving_name.to_string(),
            max_input_tokens,
            max_output_tokens,
            min_output_tokens,
            chars_per_token: 4,
            device_priority: vec![Device::Cuda, Device::Mps, Device::Cpu],
        }
    }
}

/// Errors raised while making a model available locally. These are fatal for the model's
/// operations: inference cannot proceed without its weights and tokenizer.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No model was declared for the capability.
    #[error("no model declared for capability '{0}'")]
    Undeclared(Capability),
    /// A cache file could not be downloaded.
    #[error("failed to download '{file}' for model '{repo}': {message}")]
    Download {
        /// Hub repository id.
        repo: String,
        /// File within the repository.
        file: String,
        /// Transport or status details.
        message: String,
    },
    /// Reading or writing the local cache failed.
    #[error("model cache I/O failed at {path}: {source}")]
    Io {
        /// Path that could not be accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The cached model configuration could not be parsed.
    #[error("invalid model configuration for '{repo}': {message}")]
    InvalidConfig {
        /// Hub repository id.
        repo: String,
        /// Parse failure details.
        message: String,
    },
    /// The tokenizer could not be built.
    #[error("failed to initialize tokenizer for model '{model}': {message}")]
    Tokenizer {
        /// Model whose tokenizer failed.
        model: String,
        /// Underlying failure.
        message: String,
    },
    /// The HTTP client could not be constructed.
    #[error("failed to build model hub client: {0}")]
    Client(#[source] reqwest::Error),
}
