#![deny(missing_docs)]

//! Core library for Rusty Digest: budget-aware summarization and classification of documents.

/// Inference backend abstraction and the Ollama adapter.
pub mod backend;
/// Token-budgeted text chunking.
pub mod chunking;
/// Document type classification.
pub mod classify;
/// Environment-driven configuration management.
pub mod config;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters.
pub mod metrics;
/// Model resolution, placement and memory budgeting.
pub mod resources;
/// Map-reduce summarization over text and document trees.
pub mod summarize;
/// Task queue consumption and storage.
pub mod tasks;
