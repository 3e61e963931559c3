use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::tokenize::{self, TokenCounter};
use super::{
    Capability, Device, DeviceDetector, HostDevices, ModelCache, ModelError, ModelSpec,
    device_for,
};
use crate::config::Config;

/// Declared input length used when neither the override nor the model configuration provides one.
const DEFAULT_MAX_INPUT_TOKENS: usize = 512;

/// Configuration keys that carry a model's maximum input length, in lookup order.
const CONTEXT_LENGTH_KEYS: [&str; 4] = [
    "max_position_embeddings",
    "n_positions",
    "max_seq_len",
    "n_ctx",
];

/// A resolved, device-placed model whose assets are present in the local cache.
#[derive(Clone)]
pub struct ModelHandle {
    /// Capability served by this model.
    pub capability: Capability,
    /// Hub repository id.
    pub name: String,
    /// Model name understood by the inference backend.
    pub serving_name: String,
    /// Local cache directory holding the model assets.
    pub local_cache_path: PathBuf,
    /// Device the model is placed on.
    pub device: Device,
    /// Maximum input length accepted by the model.
    pub max_input_tokens: usize,
    /// Upper bound on generated tokens.
    pub max_output_tokens: usize,
    /// Lower bound on generated tokens.
    pub min_output_tokens: usize,
    /// Characters-per-token heuristic.
    pub chars_per_token: usize,
    counter: TokenCounter,
}

impl ModelHandle {
    /// Assemble a handle from a [`ModelSpec`] and already-resolved parts.
    pub fn new(
        spec: &ModelSpec,
        local_cache_path: PathBuf,
        device: Device,
        max_input_tokens: usize,
        counter: TokenCounter,
    ) -> Self {
        Self {
            capability: spec.capability,
            name: spec.repo.clone(),
            serving_name: spec.serving_name.clone(),
            local_cache_path,
            device,
            max_input_tokens,
            max_output_tokens: spec.max_output_tokens,
            min_output_tokens: spec.min_output_tokens,
            chars_per_token: spec.chars_per_token.max(1),
            counter,
        }
    }

    /// Count tokens the way this model does.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    /// Shared handle to this model's token counter.
    pub fn token_counter(&self) -> TokenCounter {
        self.counter.clone()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("capability", &self.capability)
            .field("name", &self.name)
            .field("serving_name", &self.serving_name)
            .field("local_cache_path", &self.local_cache_path)
            .field("device", &self.device)
            .field("max_input_tokens", &self.max_input_tokens)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("min_output_tokens", &self.min_output_tokens)
            .finish_non_exhaustive()
    }
}

struct Slot {
    spec: ModelSpec,
    handle: OnceCell<Arc<ModelHandle>>,
}

/// Arena of declared models keyed by capability; each resolves at most once per process.
pub struct ModelRegistry {
    cache: ModelCache,
    detector: Arc<dyn DeviceDetector>,
    slots: HashMap<Capability, Slot>,
}

impl ModelRegistry {
    /// Declare `specs` against `cache`, placing devices with `detector`.
    pub fn new(
        cache: ModelCache,
        detector: Arc<dyn DeviceDetector>,
        specs: impl IntoIterator<Item = ModelSpec>,
    ) -> Self {
        let slots = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.capability,
                    Slot {
                        spec,
                        handle: OnceCell::new(),
                    },
                )
            })
            .collect();
        Self {
            cache,
            detector,
            slots,
        }
    }

    /// Declare every configured capability using the host device detector.
    pub fn from_config(config: &Config) -> Result<Self, ModelError> {
        let cache = ModelCache::new(
            config.model_cache_dir.clone(),
            config.model_hub_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let specs = Capability::ALL.map(|capability| config.model_spec(capability).clone());
        Ok(Self::new(cache, Arc::new(HostDevices), specs))
    }

    /// Declared [`ModelSpec`] for `capability`, if any.
    pub fn spec(&self, capability: Capability) -> Option<&ModelSpec> {
        self.slots.get(&capability).map(|slot| &slot.spec)
    }

    /// Resolve `capability` to a handle, populating the local cache on first access.
    pub async fn resolve(&self, capability: Capability) -> Result<Arc<ModelHandle>, ModelError> {
        let slot = self
            .slots
            .get(&capability)
            .ok_or(ModelError::Undeclared(capability))?;
        slot.handle
            .get_or_try_init(|| async { self.load(&slot.spec).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Resolve every declared capability, stopping at the first failure.
    pub async fn prefetch_all(&self) -> Result<Vec<Arc<ModelHandle>>, ModelError> {
        let mut capabilities: Vec<Capability> = self.slots.keys().copied().collect();
        capabilities.sort();
        let mut handles = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            handles.push(self.resolve(capability).await?);
        }
        Ok(handles)
    }

    async fn load(&self, spec: &ModelSpec) -> Result<ModelHandle, ModelError> {
        let cached = self.cache.ensure(&spec.repo).await?;
        let declared = read_declared_max_input(&spec.repo, &cached.config_path).await?;
        let max_input_tokens = spec
            .max_input_tokens
            .or(declared)
            .unwrap_or(DEFAULT_MAX_INPUT_TOKENS)
            .max(1);

        let counter = match cached.tokenizer_path.clone() {
            Some(path) => {
                let model = spec.repo.clone();
                tokio::task::spawn_blocking(move || tokenize::tokenizer_file_counter(&model, &path))
                    .await
                    .map_err(|error| ModelError::Tokenizer {
                        model: spec.repo.clone(),
                        message: error.to_string(),
                    })??
            }
            None => {
                tracing::warn!(
                    model = %spec.repo,
                    "Tokenizer unavailable for model; falling back to tiktoken counter"
                );
                tokenize::tiktoken_counter(tokenize::FALLBACK_ENCODING)?
            }
        };

        let device = device_for(&spec.device_priority, self.detector.as_ref());
        tracing::info!(
            capability = %spec.capability,
            model = %spec.repo,
            serving_name = %spec.serving_name,
            %device,
            max_input_tokens,
            declared = ?declared,
            "Model resolved"
        );

        Ok(ModelHandle::new(
            spec,
            cached.dir,
            device,
            max_input_tokens,
            counter,
        ))
    }
}

async fn read_declared_max_input(repo: &str, path: &Path) -> Result<Option<usize>, ModelError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let value: Value = serde_json::from_str(&raw).map_err(|error| ModelError::InvalidConfig {
        repo: repo.to_string(),
        message: error.to_string(),
    })?;
    Ok(declared_max_input(&value))
}

/// Maximum input length declared by a model configuration document.
fn declared_max_input(config: &Value) -> Option<usize> {
    CONTEXT_LENGTH_KEYS.iter().find_map(|key| {
        config
            .get(*key)
            .and_then(Value::as_u64)
            .filter(|value| *value > 0)
            .map(|value| value as usize)
    })
}
