use std::sync::Arc;
use sysinfo::System;

use super::ModelHandle;
use crate::config::Config;

/// Reports how much memory the host can currently spare.
pub trait MemoryGauge: Send + Sync {
    /// Available memory in bytes, or `None` when the host cannot tell.
    fn available_bytes(&self) -> Option<u64>;
}

/// Gauge backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemoryGauge for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        let mut system = System::new();
        system.refresh_memory();
        // sysinfo reports 0 on platforms it cannot query.
        Some(system.available_memory()).filter(|bytes| *bytes > 0)
    }
}

/// Token budget derived for one model at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Memory reported by the host, if known.
    pub available_bytes: Option<u64>,
    /// Memory cost assumed per token of context.
    pub bytes_per_token_estimate: u64,
    /// Effective budget: the smaller of the memory-derived and the declared limits.
    pub max_tokens: usize,
}

impl MemoryBudget {
    /// Rough character capacity of the budget.
    pub fn approx_characters(&self, chars_per_token: usize) -> usize {
        self.max_tokens.saturating_mul(chars_per_token)
    }
}

/// Maps available host memory and a model's declared input limit to a safe token budget.
///
/// The per-token cost is a conservative proxy for the inference working set, not a measurement
/// of the model. Memory queries that fail fall back to the declared limit alone.
#[derive(Clone)]
pub struct ResourceEstimator {
    memory: Arc<dyn MemoryGauge>,
    bytes_per_token: u64,
    reserve_bytes: u64,
}

impl ResourceEstimator {
    /// Create an estimator reading available bytes from `memory`.
    pub fn new(memory: Arc<dyn MemoryGauge>, bytes_per_token: u64, reserve_bytes: u64) -> Self {
        Self {
            memory,
            bytes_per_token: bytes_per_token.max(1),
            reserve_bytes,
        }
    }

    /// Estimator over the host's memory with configured costs.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(SystemMemory),
            config.bytes_per_token,
            config.memory_reserve_bytes,
        )
    }

    /// Compute the current budget for `model`.
    pub fn estimate(&self, model: &ModelHandle) -> MemoryBudget {
        let declared = model.max_input_tokens;
        let available_bytes = self.memory.available_bytes();

        let max_tokens = match available_bytes {
            Some(bytes) => {
                let usable = bytes.saturating_sub(self.reserve_bytes);
                let memory_tokens = usize::try_from(usable / self.bytes_per_token)
                    .unwrap_or(usize::MAX);
                if memory_tokens == 0 {
                    tracing::warn!(
                        model = %model.name,
                        available_bytes = bytes,
                        reserve_bytes = self.reserve_bytes,
                        "Host memory below reserve; clamping budget to a single token"
                    );
                }
                memory_tokens.min(declared).max(1)
            }
            None => {
                tracing::debug!(
                    model = %model.name,
                    declared,
                    "Host memory unknown; using declared model limit"
                );
                declared
            }
        };

        MemoryBudget {
            available_bytes,
            bytes_per_token_estimate: self.bytes_per_token,
            max_tokens,
        }
    }

    /// Maximum number of input tokens that is safe to send to `model` right now.
    pub fn max_context_tokens(&self, model: &ModelHandle) -> usize {
        self.estimate(model).max_tokens
    }
}
