//! Task queue consumption and the storage ports it depends on.
//!
//! Tasks reference document nodes (files or folders). The [`TaskConsumer`] fetches every pending
//! task in one batch, dispatches each by node kind and records the outcome. Storage sits behind
//! the [`TaskStore`], [`NodeStore`], [`ResultSink`] and [`StructureSource`] traits; [`SqliteStore`]
//! and [`DirectoryStructureSource`] are the production implementations.

mod consumer;
mod sqlite;
mod structure_source;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::summarize::{DocumentTree, StructureError};

pub use consumer::{ConsumeReport, TaskConsumer, TaskPorts};
pub use sqlite::{NodeRow, SqliteStore};
pub use structure_source::DirectoryStructureSource;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Database file location could not be prepared.
    #[error("failed to prepare database path {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Stored node kind is neither `file` nor `folder`.
    #[error("node '{node_id}' has unknown kind '{kind}'")]
    UnknownNodeKind {
        /// Node carrying the kind.
        node_id: String,
        /// Stored kind.
        kind: String,
    },
    /// Stored task status is not recognized.
    #[error("task {task_id} has unknown status '{status}'")]
    InvalidStatus {
        /// Task carrying the status.
        task_id: i64,
        /// Stored status.
        status: String,
    },
    /// Stored summary metadata is not valid JSON.
    #[error("invalid summary metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Errors that fail a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Target node has a kind the consumer cannot dispatch.
    #[error("cannot dispatch node '{node_id}' of unknown kind '{kind}'")]
    UnknownNodeKind {
        /// Target node.
        node_id: String,
        /// Stored kind.
        kind: String,
    },
    /// Target node does not exist.
    #[error("node '{0}' not found")]
    MissingNode(String),
    /// No structure tree has been produced for the file.
    #[error("no structure tree for node '{node_id}' ({path})")]
    MissingStructure {
        /// File node.
        node_id: String,
        /// File path.
        path: String,
    },
    /// Structure tree could not be loaded.
    #[error(transparent)]
    Structure(#[from] StructureError),
    /// Storage failed while processing the task.
    #[error(transparent)]
    Store(StoreError),
    /// Analysis panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl From<StoreError> for TaskError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UnknownNodeKind { node_id, kind } => {
                Self::UnknownNodeKind { node_id, kind }
            }
            other => Self::Store(other),
        }
    }
}

/// Lifecycle of a task: `pending`, then `dispatched`, then `done` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting to be fetched.
    Pending,
    /// Fetched and handed to an analyzer.
    Dispatched,
    /// Analysis completed and results were persisted.
    Done,
    /// Analysis failed; details are in the logs.
    Failed,
}

impl TaskStatus {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// Kind of document node a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Single document.
    File,
    /// Directory of documents.
    Folder,
}

impl NodeKind {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

impl FromStr for NodeKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "folder" => Ok(Self::Folder),
            _ => Err(()),
        }
    }
}

/// Unit of work queued by an external producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Row id.
    pub id: i64,
    /// Document node to analyze.
    pub target_node_id: String,
    /// Free-form task name.
    pub name: String,
    /// Current status.
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: i64,
    /// Creation timestamp (RFC 3339).
    pub created_at: Option<String>,
    /// Completion timestamp (RFC 3339).
    pub performed_at: Option<String>,
}

/// File or folder known to the ingestion subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentNode {
    /// Node id.
    pub id: String,
    /// File or folder.
    pub kind: NodeKind,
    /// Filesystem path.
    pub path: String,
    /// File extension without the dot, if any.
    pub extension: Option<String>,
    /// Child node ids, for folders.
    pub children: Vec<String>,
}

/// Result persisted per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
    /// Summary text.
    pub summary: String,
    /// Classification and provenance details.
    pub metadata: serde_json::Value,
}

/// Source of queued tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every pending task, highest priority first, then by id.
    async fn pending_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Record a status change; `performed_at` is kept when `None`.
    async fn update_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        performed_at: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Read-only lookup of document nodes.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Node by id, with its children.
    ///
    /// Unknown kinds are reported as [`StoreError::UnknownNodeKind`].
    async fn node(&self, node_id: &str) -> Result<Option<DocumentNode>, StoreError>;
}

/// Upsert-by-node store for analysis results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Insert or replace the payload for `node_id`.
    async fn upsert(&self, node_id: &str, payload: &SummaryPayload) -> Result<(), StoreError>;

    /// Payload previously stored for `node_id`.
    async fn fetch(&self, node_id: &str) -> Result<Option<SummaryPayload>, StoreError>;
}

/// Provider of converted document trees.
#[async_trait]
pub trait StructureSource: Send + Sync {
    /// Structure tree for a file node, or `None` when none has been produced.
    async fn load(&self, node: &DocumentNode) -> Result<Option<DocumentTree>, StructureError>;
}
