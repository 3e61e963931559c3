//! SQLite-backed task, node and result storage.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{
    DocumentNode, NodeKind, NodeStore, ResultSink, StoreError, SummaryPayload, Task, TaskStatus,
    TaskStore,
};

const MIGRATIONS: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS task (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        target_node_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
        performed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_node (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        kind TEXT NOT NULL,
        path TEXT NOT NULL,
        extension TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_summary (
        node_id TEXT PRIMARY KEY,
        summary TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_status ON task(status, priority DESC, id)",
    "CREATE INDEX IF NOT EXISTS idx_document_node_parent ON document_node(parent_id)",
];

/// Document node as written by a producer. `kind` is stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRow {
    /// Node id.
    pub id: String,
    /// Parent folder, if any.
    pub parent_id: Option<String>,
    /// `file` or `folder`.
    pub kind: String,
    /// Filesystem path.
    pub path: String,
    /// File extension without the dot.
    pub extension: Option<String>,
}

/// Store implementing every relational port on one SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "Task database ready");
        Ok(store)
    }

    /// Create the task, node and summary tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Queue a pending task for `target_node_id` and return its id.
    pub async fn enqueue(
        &self,
        target_node_id: &str,
        name: &str,
        priority: i64,
    ) -> Result<i64, StoreError> {
        let result =
            sqlx::query("INSERT INTO task (target_node_id, name, priority) VALUES (?, ?, ?)")
                .bind(target_node_id)
                .bind(name)
                .bind(priority)
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert or replace a document node.
    pub async fn insert_node(&self, node: &NodeRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO document_node (id, parent_id, kind, path, extension)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                kind = excluded.kind,
                path = excluded.path,
                extension = excluded.extension
            "#,
        )
        .bind(&node.id)
        .bind(&node.parent_id)
        .bind(&node.kind)
        .bind(&node.path)
        .bind(&node.extension)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Task by id, whatever its status.
    pub async fn task(&self, task_id: i64) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            "SELECT id, target_node_id, name, status, priority, created_at, performed_at \
             FROM task WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse()
        .map_err(|()| StoreError::InvalidStatus { task_id: id, status })?;
    Ok(Task {
        id,
        target_node_id: row.try_get("target_node_id")?,
        name: row.try_get("name")?,
        status,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        performed_at: row.try_get("performed_at")?,
    })
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn pending_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, target_node_id, name, status, priority, created_at, performed_at \
             FROM task WHERE status = ? ORDER BY priority DESC, id ASC",
        )
        .bind(TaskStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        performed_at: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE task SET status = ?, performed_at = COALESCE(?, performed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(performed_at)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn node(&self, node_id: &str) -> Result<Option<DocumentNode>, StoreError> {
        let row = sqlx::query("SELECT id, kind, path, extension FROM document_node WHERE id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.try_get("kind")?;
        let kind: NodeKind = kind.parse().map_err(|()| StoreError::UnknownNodeKind {
            node_id: node_id.to_string(),
            kind,
        })?;

        let children = sqlx::query_scalar(
            "SELECT id FROM document_node WHERE parent_id = ? ORDER BY path ASC, id ASC",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(DocumentNode {
            id: row.try_get("id")?,
            kind,
            path: row.try_get("path")?,
            extension: row.try_get("extension")?,
            children,
        }))
    }
}

#[async_trait]
impl ResultSink for SqliteStore {
    async fn upsert(&self, node_id: &str, payload: &SummaryPayload) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&payload.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO node_summary (node_id, summary, metadata_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                summary = excluded.summary,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node_id)
        .bind(&payload.summary)
        .bind(metadata)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, node_id: &str) -> Result<Option<SummaryPayload>, StoreError> {
        let row = sqlx::query("SELECT summary, metadata_json FROM node_summary WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let metadata: String = row.try_get("metadata_json")?;
        Ok(Some(SummaryPayload {
            summary: row.try_get("summary")?,
            metadata: serde_json::from_str(&metadata)?,
        }))
    }
}
