use crate::resources::{Capability, Device, ModelSpec};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_INFERENCE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL_HUB_URL: &str = "https://huggingface.co";
const DEFAULT_BYTES_PER_TOKEN: u64 = 2048;
const DEFAULT_MEMORY_RESERVE_BYTES: u64 = 5000 * 1024;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for Rusty Digest.
///
/// Built once by the binary and handed to every service constructor; nothing in the library
/// reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding tasks, document nodes, and stored summaries.
    pub database_path: PathBuf,
    /// Directory where converted document structure trees are written.
    pub structure_dir: PathBuf,
    /// Base URL of the Ollama-compatible inference backend.
    pub inference_url: String,
    /// Base URL of the model hub used to populate the local model cache.
    pub model_hub_url: String,
    /// Root of the local model cache.
    pub model_cache_dir: PathBuf,
    /// Declared summarization model.
    pub summarizer: ModelSpec,
    /// Declared document type classification model.
    pub classifier: ModelSpec,
    /// Declared embedding model.
    pub embedder: ModelSpec,
    /// Accelerators to try, in order, when placing models.
    pub device_priority: Vec<Device>,
    /// Memory cost assumed for each token of inference context.
    pub bytes_per_token: u64,
    /// Memory kept free before deriving a token budget.
    pub memory_reserve_bytes: u64,
    /// Tokens shared between consecutive chunks.
    pub chunk_overlap_tokens: usize,
    /// Headroom subtracted from the summarizer budget for prompt text.
    pub prompt_reserve_tokens: usize,
    /// Summaries shorter than this are discarded as noise.
    pub min_summary_chars: usize,
    /// Timeout applied to every inference request.
    pub request_timeout_secs: u64,
    /// Optional TOML file describing the document taxonomy.
    pub taxonomy_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let device_priority = match load_env_optional("DEVICE_PRIORITY") {
            Some(value) => parse_device_priority(&value)?,
            None => vec![Device::Cuda, Device::Mps, Device::Cpu],
        };

        Ok(Self {
            database_path: PathBuf::from(load_env("DATABASE_PATH")?),
            structure_dir: PathBuf::from(load_env("STRUCTURE_DIR")?),
            inference_url: load_env_optional("INFERENCE_URL")
                .unwrap_or_else(|| DEFAULT_INFERENCE_URL.to_string()),
            model_hub_url: load_env_optional("MODEL_HUB_URL")
                .unwrap_or_else(|| DEFAULT_MODEL_HUB_URL.to_string()),
            model_cache_dir: load_env_optional("MODEL_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_cache_dir),
            summarizer: load_model_spec(Capability::Summarizer, &device_priority)?,
            classifier: load_model_spec(Capability::Classifier, &device_priority)?,
            embedder: load_model_spec(Capability::Embedder, &device_priority)?,
            bytes_per_token: parse_optional("BYTES_PER_TOKEN")?
                .unwrap_or(DEFAULT_BYTES_PER_TOKEN)
                .max(1),
            memory_reserve_bytes: parse_optional("MEMORY_RESERVE_BYTES")?
                .unwrap_or(DEFAULT_MEMORY_RESERVE_BYTES),
            chunk_overlap_tokens: parse_optional("CHUNK_OVERLAP_TOKENS")?.unwrap_or(32),
            prompt_reserve_tokens: parse_optional("PROMPT_RESERVE_TOKENS")?.unwrap_or(64),
            min_summary_chars: parse_optional("MIN_SUMMARY_CHARS")?.unwrap_or(20),
            request_timeout_secs: parse_optional("REQUEST_TIMEOUT_SECS")?.unwrap_or(300),
            taxonomy_path: load_env_optional("DOCUMENT_TAXONOMY_PATH").map(PathBuf::from),
            device_priority,
        })
    }

    /// Declared model for the given capability.
    pub fn model_spec(&self, capability: Capability) -> &ModelSpec {
        match capability {
            Capability::Summarizer => &self.summarizer,
            Capability::Classifier => &self.classifier,
            Capability::Embedder => &self.embedder,
        }
    }
}

/// Read `.env` (if present) and load configuration from the environment.
pub fn load() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        database = %config.database_path.display(),
        structure_dir = %config.structure_dir.display(),
        inference_url = %config.inference_url,
        summarizer = %config.summarizer.repo,
        classifier = %config.classifier.repo,
        embedder = %config.embedder.repo,
        "Loaded configuration"
    );
    Ok(config)
}

fn load_model_spec(
    capability: Capability,
    device_priority: &[Device],
) -> Result<ModelSpec, ConfigError> {
    let prefix = capability.env_prefix();
    let mut spec = ModelSpec::default_for(capability);
    if let Some(repo) = load_env_optional(&format!("{prefix}_MODEL")) {
        spec.serving_name = repo.clone();
        spec.repo = repo;
    }
    if let Some(serving) = load_env_optional(&format!("{prefix}_SERVING_NAME")) {
        spec.serving_name = serving;
    }
    if let Some(value) = parse_optional(&format!("{prefix}_MAX_INPUT_TOKENS"))? {
        spec.max_input_tokens = Some(value);
    }
    if let Some(value) = parse_optional(&format!("{prefix}_MAX_OUTPUT_TOKENS"))? {
        spec.max_output_tokens = value;
    }
    if let Some(value) = parse_optional(&format!("{prefix}_MIN_OUTPUT_TOKENS"))? {
        spec.min_output_tokens = value;
    }
    if spec.min_output_tokens > spec.max_output_tokens {
        return Err(ConfigError::InvalidValue(format!("{prefix}_MIN_OUTPUT_TOKENS")));
    }
    spec.device_priority = device_priority.to_vec();
    Ok(spec)
}

fn parse_device_priority(value: &str) -> Result<Vec<Device>, ConfigError> {
    let devices = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|()| ConfigError::InvalidValue("DEVICE_PRIORITY".to_string()))
        })
        .collect::<Result<Vec<Device>, _>>()?;
    if devices.is_empty() {
        return Err(ConfigError::InvalidValue("DEVICE_PRIORITY".to_string()));
    }
    Ok(devices)
}

fn default_cache_dir() -> PathBuf {
    let base = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(base)
        .join(".cache")
        .join("rusty-digest")
        .join("models")
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    load_env_optional(key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}
