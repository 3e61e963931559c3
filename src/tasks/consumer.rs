use futures_util::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{
    DocumentNode, NodeKind, NodeStore, ResultSink, StoreError, StructureSource, SummaryPayload,
    Task, TaskError, TaskStatus, TaskStore,
};
use crate::classify::DocumentTypeClassifier;
use crate::metrics::PipelineMetrics;
use crate::summarize::HierarchicalSummarizer;

/// Storage collaborators of a [`TaskConsumer`].
#[derive(Clone)]
pub struct TaskPorts {
    /// Queue of tasks.
    pub tasks: Arc<dyn TaskStore>,
    /// Document node lookup.
    pub nodes: Arc<dyn NodeStore>,
    /// Result persistence.
    pub results: Arc<dyn ResultSink>,
    /// Converted document trees.
    pub structures: Arc<dyn StructureSource>,
}

/// Outcome of one consume batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Tasks dispatched, whether or not they succeeded.
    pub attempted: usize,
}

impl ConsumeReport {
    /// Human-readable batch summary.
    pub fn message(&self) -> String {
        format!(
            "All tasks done. Number of tasks performed: {}",
            self.attempted
        )
    }
}

/// Drains pending tasks one at a time, isolating failures per task.
///
/// Only one consumer may run against a task store at a time: tasks are not claimed atomically.
///
/// Folder analysis reads whatever child summaries are stored when the folder task runs. Producers
/// must give folder tasks a lower priority than the file tasks beneath them; a folder processed
/// early is still marked done, with `children_summarized` below `children_total`.
pub struct TaskConsumer {
    ports: TaskPorts,
    summarizer: Arc<HierarchicalSummarizer>,
    classifier: Arc<DocumentTypeClassifier>,
    metrics: Arc<PipelineMetrics>,
}

impl TaskConsumer {
    /// Consumer over `ports` analyzing with `summarizer` and `classifier`.
    pub fn new(
        ports: TaskPorts,
        summarizer: Arc<HierarchicalSummarizer>,
        classifier: Arc<DocumentTypeClassifier>,
    ) -> Self {
        Self {
            ports,
            summarizer,
            classifier,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Record task outcomes into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Fetch every pending task and process them in order.
    ///
    /// Only a failure to fetch the batch is returned; per-task failures are logged and recorded
    /// on the task row.
    pub async fn consume(&self) -> Result<ConsumeReport, StoreError> {
        let tasks = self.ports.tasks.pending_tasks().await?;
        tracing::info!(tasks = tasks.len(), "Consuming pending tasks");

        for task in &tasks {
            self.run(task).await;
        }

        let report = ConsumeReport {
            attempted: tasks.len(),
        };
        let snapshot = self.metrics.snapshot();
        tracing::info!(
            attempted = report.attempted,
            tasks_failed = snapshot.tasks_failed,
            chunks_summarized = snapshot.chunks_summarized,
            model_calls = snapshot.model_calls,
            "{}",
            report.message()
        );
        Ok(report)
    }

    async fn run(&self, task: &Task) {
        tracing::info!(
            task_id = task.id,
            node_id = %task.target_node_id,
            name = %task.name,
            "Dispatching task"
        );
        if let Err(error) = self
            .ports
            .tasks
            .update_status(task.id, TaskStatus::Dispatched, None)
            .await
        {
            tracing::warn!(task_id = task.id, error = %error, "Failed to mark task dispatched");
        }

        let outcome = AssertUnwindSafe(self.dispatch(task)).catch_unwind().await;
        let result = outcome
            .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));

        let status = match &result {
            Ok(()) => {
                tracing::info!(task_id = task.id, "Task done");
                TaskStatus::Done
            }
            Err(error) => {
                tracing::error!(
                    task_id = task.id,
                    node_id = %task.target_node_id,
                    error = %error,
                    "Task failed"
                );
                TaskStatus::Failed
            }
        };
        self.metrics.record_task(result.is_err());

        if let Err(error) = self
            .ports
            .tasks
            .update_status(task.id, status, Some(now_rfc3339()))
            .await
        {
            tracing::error!(
                task_id = task.id,
                error = %error,
                %status,
                "Failed to record task outcome"
            );
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<(), TaskError> {
        let node = self
            .ports
            .nodes
            .node(&task.target_node_id)
            .await?
            .ok_or_else(|| TaskError::MissingNode(task.target_node_id.clone()))?;

        match node.kind {
            NodeKind::File => self.analyze_file(&node).await,
            NodeKind::Folder => self.analyze_folder(&node).await,
        }
    }

    async fn analyze_file(&self, node: &DocumentNode) -> Result<(), TaskError> {
        tracing::info!(node_id = %node.id, path = %node.path, "Analyzing file");
        let tree = self
            .ports
            .structures
            .load(node)
            .await?
            .ok_or_else(|| TaskError::MissingStructure {
                node_id: node.id.clone(),
                path: node.path.clone(),
            })?;

        let summary = self.summarizer.summarize_document(&tree, &node.id).await;
        let classification = self.classifier.classify(&tree.plain_text(tree.root())).await;

        let payload = SummaryPayload {
            summary: summary.text,
            metadata: json!({
                "doc_type": classification.doc_type,
                "doc_subtype": classification.doc_subtype,
                "path": node.path,
                "extension": node.extension,
                "nodes_summarized": summary.nodes_summarized,
            }),
        };
        self.ports.results.upsert(&node.id, &payload).await?;
        Ok(())
    }

    async fn analyze_folder(&self, node: &DocumentNode) -> Result<(), TaskError> {
        tracing::info!(
            node_id = %node.id,
            path = %node.path,
            children = node.children.len(),
            "Analyzing folder"
        );
        let mut summaries = Vec::new();
        for child in &node.children {
            match self.ports.results.fetch(child).await? {
                Some(payload) if !payload.summary.trim().is_empty() => {
                    summaries.push(payload.summary)
                }
                _ => tracing::debug!(node_id = %child, "Child has no summary yet"),
            }
        }

        if summaries.len() < node.children.len() {
            tracing::warn!(
                node_id = %node.id,
                children = node.children.len(),
                children_summarized = summaries.len(),
                "Folder summarized before all of its children"
            );
        }

        let summary = self.summarizer.summarize_flat(&summaries.join("\n")).await;
        let payload = SummaryPayload {
            summary,
            metadata: json!({
                "path": node.path,
                "children_summarized": summaries.len(),
                "children_total": node.children.len(),
            }),
        };
        self.ports.results.upsert(&node.id, &payload).await?;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, declared_limit_estimator, model};
    use crate::classify::Taxonomy;
    use crate::resources::Capability;
    use crate::summarize::{ContentNode, DocumentTree, StructureError, SummarizerSettings};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        tasks: Mutex<Vec<Task>>,
        nodes: HashMap<String, Result<DocumentNode, String>>,
        results: Mutex<HashMap<String, SummaryPayload>>,
    }

    impl MemoryStore {
        fn with_tasks(mut self, targets: &[&str]) -> Self {
            let tasks = targets
                .iter()
                .enumerate()
                .map(|(index, target)| Task {
                    id: index as i64 + 1,
                    target_node_id: target.to_string(),
                    name: "analyze".into(),
                    status: TaskStatus::Pending,
                    priority: 0,
                    created_at: None,
                    performed_at: None,
                })
                .collect();
            self.tasks = Mutex::new(tasks);
            self
        }

        fn with_node(mut self, id: &str, kind: NodeKind, path: &str, children: &[&str]) -> Self {
            self.nodes.insert(
                id.to_string(),
                Ok(DocumentNode {
                    id: id.to_string(),
                    kind,
                    path: path.to_string(),
                    extension: Some("pdf".into()),
                    children: children.iter().map(|child| child.to_string()).collect(),
                }),
            );
            self
        }

        fn with_unknown_kind(mut self, id: &str, kind: &str) -> Self {
            self.nodes.insert(id.to_string(), Err(kind.to_string()));
            self
        }

        fn status(&self, task_id: i64) -> TaskStatus {
            self.tasks
                .lock()
                .expect("tasks lock")
                .iter()
                .find(|task| task.id == task_id)
                .map(|task| task.status)
                .expect("task")
        }

        fn result(&self, node_id: &str) -> Option<SummaryPayload> {
            self.results.lock().expect("results lock").get(node_id).cloned()
        }
    }

    #[async_trait]
    impl TaskStore for MemoryStore {
        async fn pending_tasks(&self) -> Result<Vec<Task>, StoreError> {
            Ok(self
                .tasks
                .lock()
                .expect("tasks lock")
                .iter()
                .filter(|task| task.status == TaskStatus::Pending)
                .cloned()
                .collect())
        }

        async fn update_status(
            &self,
            task_id: i64,
            status: TaskStatus,
            performed_at: Option<String>,
        ) -> Result<(), StoreError> {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|task| task.id == task_id) {
                task.status = status;
                if performed_at.is_some() {
                    task.performed_at = performed_at;
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NodeStore for MemoryStore {
        async fn node(&self, node_id: &str) -> Result<Option<DocumentNode>, StoreError> {
            match self.nodes.get(node_id) {
                None => Ok(None),
                Some(Ok(node)) => Ok(Some(node.clone())),
                Some(Err(kind)) => Err(StoreError::UnknownNodeKind {
                    node_id: node_id.to_string(),
                    kind: kind.clone(),
                }),
            }
        }
    }

    #[async_trait]
    impl ResultSink for MemoryStore {
        async fn upsert(&self, node_id: &str, payload: &SummaryPayload) -> Result<(), StoreError> {
            self.results
                .lock()
                .expect("results lock")
                .insert(node_id.to_string(), payload.clone());
            Ok(())
        }

        async fn fetch(&self, node_id: &str) -> Result<Option<SummaryPayload>, StoreError> {
            Ok(self.result(node_id))
        }
    }

    struct Trees(HashMap<String, DocumentTree>);

    #[async_trait]
    impl StructureSource for Trees {
        async fn load(&self, node: &DocumentNode) -> Result<Option<DocumentTree>, StructureError> {
            if node.path.contains("explode") {
                panic!("converter crashed on {}", node.path);
            }
            Ok(self.0.get(&node.path).cloned())
        }
    }

    fn tree(text: &str) -> DocumentTree {
        DocumentTree::new(
            "#/body",
            [
                ContentNode::group("#/body", ["#/texts/0"]),
                ContentNode::leaf("#/texts/0", text),
            ],
        )
    }

    fn consumer(
        store: Arc<MemoryStore>,
        trees: Trees,
    ) -> (TaskConsumer, Arc<PipelineMetrics>, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::new(|request| {
            if request.prompt.starts_with("You are an NLP Engineer") {
                Ok("legal".to_string())
            } else if request.prompt.starts_with("For a legal document") {
                Ok("nda".to_string())
            } else {
                Ok("a summary long enough to keep".to_string())
            }
        }));
        let metrics = Arc::new(PipelineMetrics::new());
        let summarizer = HierarchicalSummarizer::new(
            backend.clone(),
            model(Capability::Summarizer, 256),
            Some(model(Capability::Embedder, 256)),
            declared_limit_estimator(),
            SummarizerSettings::default(),
        )
        .with_metrics(metrics.clone());
        let classifier = DocumentTypeClassifier::new(
            backend.clone(),
            model(Capability::Classifier, 256),
            Taxonomy::builtin(),
        )
        .with_metrics(metrics.clone());
        let ports = TaskPorts {
            tasks: store.clone(),
            nodes: store.clone(),
            results: store,
            structures: Arc::new(trees),
        };
        (
            TaskConsumer::new(ports, Arc::new(summarizer), Arc::new(classifier))
                .with_metrics(metrics.clone()),
            metrics,
            backend,
        )
    }

    #[tokio::test]
    async fn failing_task_does_not_abort_batch() {
        let store = Arc::new(
            MemoryStore::default()
                .with_tasks(&["f1", "odd", "f3"])
                .with_node("f1", NodeKind::File, "/docs/one.pdf", &[])
                .with_unknown_kind("odd", "symlink")
                .with_node("f3", NodeKind::File, "/docs/three.pdf", &[]),
        );
        let trees = Trees(HashMap::from([
            ("/docs/one.pdf".to_string(), tree("first document")),
            ("/docs/three.pdf".to_string(), tree("third document")),
        ]));
        let (consumer, metrics, backend) = consumer(store.clone(), trees);

        let report = consumer.consume().await.expect("report");
        assert_eq!(report.attempted, 3);
        assert_eq!(
            report.message(),
            "All tasks done. Number of tasks performed: 3"
        );
        assert_eq!(store.status(1), TaskStatus::Done);
        assert_eq!(store.status(2), TaskStatus::Failed);
        assert_eq!(store.status(3), TaskStatus::Done);
        assert_eq!(metrics.snapshot().tasks_failed, 1);

        let payload = store.result("f1").expect("payload");
        assert_eq!(payload.summary, "a summary long enough to keep");
        assert_eq!(payload.metadata["doc_type"], "legal");
        assert_eq!(payload.metadata["doc_subtype"], "nda");
        assert_eq!(payload.metadata["extension"], "pdf");
        assert_eq!(payload.metadata["nodes_summarized"], 2);
        assert!(backend.embedded().is_empty());
    }

    #[tokio::test]
    async fn panics_and_missing_inputs_fail_only_their_task() {
        let store = Arc::new(
            MemoryStore::default()
                .with_tasks(&["boom", "ghost", "nostructure", "ok"])
                .with_node("boom", NodeKind::File, "/docs/explode.pdf", &[])
                .with_node("nostructure", NodeKind::File, "/docs/raw.pdf", &[])
                .with_node("ok", NodeKind::File, "/docs/ok.pdf", &[]),
        );
        let trees = Trees(HashMap::from([(
            "/docs/ok.pdf".to_string(),
            tree("fine document"),
        )]));
        let (consumer, _, _) = consumer(store.clone(), trees);

        let report = consumer.consume().await.expect("report");
        assert_eq!(report.attempted, 4);
        assert_eq!(store.status(1), TaskStatus::Failed);
        assert_eq!(store.status(2), TaskStatus::Failed);
        assert_eq!(store.status(3), TaskStatus::Failed);
        assert_eq!(store.status(4), TaskStatus::Done);
        assert!(store.tasks.lock().expect("tasks lock")[0].performed_at.is_some());
    }

    #[tokio::test]
    async fn folder_summarizes_child_summaries() {
        let store = Arc::new(
            MemoryStore::default()
                .with_tasks(&["f1", "dir"])
                .with_node("dir", NodeKind::Folder, "/docs", &["f1", "f2"])
                .with_node("f1", NodeKind::File, "/docs/one.pdf", &[]),
        );
        let trees = Trees(HashMap::from([(
            "/docs/one.pdf".to_string(),
            tree("only document"),
        )]));
        let (consumer, _, _) = consumer(store.clone(), trees);

        consumer.consume().await.expect("report");
        let payload = store.result("dir").expect("folder payload");
        assert_eq!(payload.summary, "a summary long enough to keep");
        assert_eq!(payload.metadata["children_summarized"], 1);
        assert_eq!(payload.metadata["children_total"], 2);
    }

    #[tokio::test]
    async fn empty_folder_stores_empty_summary() {
        let store = Arc::new(
            MemoryStore::default()
                .with_tasks(&["dir"])
                .with_node("dir", NodeKind::Folder, "/empty", &[]),
        );
        let (consumer, _, _) = consumer(store.clone(), Trees(HashMap::new()));

        consumer.consume().await.expect("report");
        assert_eq!(store.status(1), TaskStatus::Done);
        assert_eq!(store.result("dir").expect("payload").summary, "");
    }

    #[tokio::test]
    async fn empty_queue_reports_zero() {
        let store = Arc::new(MemoryStore::default());
        let (consumer, _, _) = consumer(store, Trees(HashMap::new()));
        let report = consumer.consume().await.expect("report");
        assert_eq!(report, ConsumeReport { attempted: 0 });
    }
}
