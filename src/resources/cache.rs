use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ModelError;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Files of a model present in the local cache.
#[derive(Debug, Clone)]
pub struct CachedModel {
    /// Cache directory for the model.
    pub dir: PathBuf,
    /// Model configuration (declared limits).
    pub config_path: PathBuf,
    /// Tokenizer definition, when the hub publishes one.
    pub tokenizer_path: Option<PathBuf>,
}

/// Deterministic on-disk cache of model assets, populated from a model hub on first use.
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
    hub_url: String,
    http: Client,
}

impl ModelCache {
    /// Create a cache rooted at `root` that downloads from `hub_url`.
    pub fn new(
        root: impl Into<PathBuf>,
        hub_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let http = Client::builder()
            .user_agent("rusty-digest/models")
            .timeout(timeout)
            .build()
            .map_err(ModelError::Client)?;
        Ok(Self {
            root: root.into(),
            hub_url: hub_url.into(),
            http,
        })
    }

    /// Local directory for `repo`; `/` separators become `--`.
    pub fn local_path(&self, repo: &str) -> PathBuf {
        let sanitized = repo.trim().trim_matches('/').replace('/', "--");
        self.root.join(sanitized)
    }

    /// Make sure the model's assets exist locally, downloading whatever is missing.
    ///
    /// `config.json` is required: any failure to fetch it is returned. A `tokenizer.json` that
    /// the hub does not publish (404) is reported as absent rather than as an error.
    pub async fn ensure(&self, repo: &str) -> Result<CachedModel, ModelError> {
        let dir = self.local_path(repo);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ModelError::Io {
                path: dir.clone(),
                source,
            })?;

        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            tracing::info!(repo, file = CONFIG_FILE, "Downloading model asset");
            self.download(repo, CONFIG_FILE, &config_path, true)
                .await?;
        }

        let tokenizer_path = dir.join(TOKENIZER_FILE);
        let tokenizer_path = if tokenizer_path.exists() {
            Some(tokenizer_path)
        } else {
            tracing::info!(repo, file = TOKENIZER_FILE, "Downloading model asset");
            self.download(repo, TOKENIZER_FILE, &tokenizer_path, false)
                .await?
                .then_some(tokenizer_path)
        };

        Ok(CachedModel {
            dir,
            config_path,
            tokenizer_path,
        })
    }

    fn file_url(&self, repo: &str, file: &str) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.hub_url.trim_end_matches('/'),
            repo.trim_matches('/'),
            file
        )
    }

    /// Fetch one file into the cache. Returns `false` when an optional file does not exist.
    async fn download(
        &self,
        repo: &str,
        file: &str,
        target: &Path,
        required: bool,
    ) -> Result<bool, ModelError> {
        let url = self.file_url(repo, file);
        let failure = |message: String| ModelError::Download {
            repo: repo.to_string(),
            file: file.to_string(),
            message,
        };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|error| failure(format!("request to {url} failed: {error}")))?;

        if response.status() == StatusCode::NOT_FOUND && !required {
            tracing::warn!(repo, file, "Model hub does not publish this file");
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(failure(format!("{url} returned {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| failure(format!("failed to read body: {error}")))?;

        let partial = target.with_extension("partial");
        tokio::fs::write(&partial, &bytes)
            .await
            .map_err(|source| ModelError::Io {
                path: partial.clone(),
                source,
            })?;
        tokio::fs::rename(&partial, target)
            .await
            .map_err(|source| ModelError::Io {
                path: target.to_path_buf(),
                source,
            })?;

        tracing::debug!(repo, file, bytes = bytes.len(), "Cached model asset");
        Ok(true)
    }
}
