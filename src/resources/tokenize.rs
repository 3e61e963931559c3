//! Token counters backing chunk budgets.
//!
//! A resolved model counts tokens with its own `tokenizer.json` when the hub publishes one.
//! Otherwise `tiktoken-rs` encodings stand in, which is close enough for budgeting with most
//! BPE models. The whitespace counter exists for tests and for callers without a model.

use anyhow::Error as TokenizerError;
use std::path::Path;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, r50k_base};

use super::ModelError;

/// Shared token counting function.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Encoding used when a model publishes no tokenizer of its own.
pub const FALLBACK_ENCODING: &str = "cl100k_base";

/// Build a counter from a Hugging Face `tokenizer.json`.
pub fn tokenizer_file_counter(model: &str, path: &Path) -> Result<TokenCounter, ModelError> {
    let tokenizer =
        tokenizers::Tokenizer::from_file(path).map_err(|error| ModelError::Tokenizer {
            model: model.to_string(),
            message: error.to_string(),
        })?;
    let tokenizer = Arc::new(tokenizer);

    Ok(Arc::new(move |segment: &str| {
        match tokenizer.encode(segment, false) {
            Ok(encoding) => encoding.len(),
            // Encoding only fails on pathological normalizer input; approximate.
            Err(_) => segment.len().div_ceil(4),
        }
    }))
}

/// Build a counter backed by a `tiktoken` encoding or model name.
pub fn tiktoken_counter(name: &str) -> Result<TokenCounter, ModelError> {
    let encoding = resolve_encoding(name).map_err(|source| ModelError::Tokenizer {
        model: name.to_string(),
        message: source.to_string(),
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(name: &str) -> Result<CoreBPE, TokenizerError> {
    match encoding_from_name(name) {
        Some(encoding) => encoding,
        None => match get_bpe_from_model(name) {
            Ok(encoding) => Ok(encoding),
            Err(error) => {
                tracing::warn!(
                    name,
                    error = %error,
                    "Falling back to 'cl100k_base' encoding for token counting"
                );
                cl100k_base()
            }
        },
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

/// Count whitespace-delimited words; non-empty text without words counts as one token.
pub fn whitespace_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}
