use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    tasks_attempted: AtomicU64,
    tasks_failed: AtomicU64,
    chunks_summarized: AtomicU64,
    model_calls: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task that was dispatched, and whether it failed.
    pub fn record_task(&self, failed: bool) {
        self.tasks_attempted.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record chunks sent through the map step.
    pub fn record_chunks(&self, count: u64) {
        self.chunks_summarized.fetch_add(count, Ordering::Relaxed);
    }

    /// Record one generate or embed request to the backend.
    pub fn record_model_call(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_attempted: self.tasks_attempted.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            chunks_summarized: self.chunks_summarized.load(Ordering::Relaxed),
            model_calls: self.model_calls.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Tasks dispatched since startup.
    pub tasks_attempted: u64,
    /// Tasks that ended in failure.
    pub tasks_failed: u64,
    /// Chunks passed through the map step.
    pub chunks_summarized: u64,
    /// Requests issued to the inference backend.
    pub model_calls: u64,
}
