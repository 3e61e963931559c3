//! Map-reduce summarization over flat text and document structure trees.
//!
//! Flat mode chunks text to the summarizer's live token budget (minus a prompt reserve), maps
//! each chunk to a summary, drops degenerate summaries and reduces the survivors. Reduction
//! repeats while the joined summaries exceed the budget; a pass that fails to shrink the text
//! falls back to truncating it at a word boundary.
//!
//! Tree mode walks a [`DocumentTree`] in post-order. Leaves keep their raw text; internal nodes
//! summarize the join of their children's texts. The root's children summary is the document
//! summary.

mod structure;

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::backend::{GenerateRequest, InferenceBackend};
use crate::chunking::{Chunk, TextChunker};
use crate::config::Config;
use crate::metrics::PipelineMetrics;
use crate::resources::{ModelHandle, ResourceEstimator};

pub use structure::{ContentNode, DocumentTree, StructureError};

const MAP_PROMPT: &str = "Write a concise summary of the following text:\n{text}\n\nCONCISE SUMMARY:";
const REDUCE_PROMPT: &str =
    "Write a concise summary of the following summaries:\n{text}\n\nCONCISE SUMMARY:";

/// Upper bound on reduce passes before falling back to truncation.
const MAX_REDUCE_PASSES: usize = 4;

const SUMMARY_TEMPERATURE: f32 = 0.2;

/// Tunables for [`HierarchicalSummarizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizerSettings {
    /// Tokens held back from the budget for the prompt template.
    pub prompt_reserve_tokens: usize,
    /// Summaries shorter than this many characters are discarded as noise.
    pub min_summary_chars: usize,
    /// Overlap between consecutive chunks, in tokens.
    pub overlap_tokens: usize,
    /// Separator placed between summaries before reducing them.
    pub separator: String,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            prompt_reserve_tokens: 64,
            min_summary_chars: 20,
            overlap_tokens: 32,
            separator: " -- ".to_string(),
        }
    }
}

impl SummarizerSettings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            prompt_reserve_tokens: config.prompt_reserve_tokens,
            min_summary_chars: config.min_summary_chars,
            overlap_tokens: config.chunk_overlap_tokens,
            ..Self::default()
        }
    }
}

/// Per-node result of tree summarization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeSummary {
    /// Leaf text, for nodes that carry text.
    pub raw_text: Option<String>,
    /// Summary of the node's children, for internal nodes.
    pub children_summary: Option<String>,
    /// Embedding of `raw_text` or `children_summary`, when an embedder is configured.
    pub embedding: Option<Vec<f32>>,
}

impl NodeSummary {
    /// Text a parent should consume: raw text if present, else the children summary.
    pub fn text(&self) -> Option<&str> {
        self.raw_text
            .as_deref()
            .or(self.children_summary.as_deref())
            .filter(|text| !text.trim().is_empty())
    }
}

/// Document-level summary handed to the caller for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryResult {
    /// Summary text; empty when nothing could be summarized.
    pub text: String,
    /// Node the summary describes.
    pub source_node_id: String,
    /// Number of tree nodes that produced a result.
    pub nodes_summarized: usize,
}

enum Visit {
    Enter(String),
    Exit(String),
}

/// Reduces flat text or document trees to a single bounded summary.
pub struct HierarchicalSummarizer {
    backend: Arc<dyn InferenceBackend>,
    summarizer: Arc<ModelHandle>,
    embedder: Option<Arc<ModelHandle>>,
    estimator: ResourceEstimator,
    chunker: TextChunker,
    settings: SummarizerSettings,
    metrics: Arc<PipelineMetrics>,
}

impl HierarchicalSummarizer {
    /// Summarizer generating with `summarizer` and, if given, embedding with `embedder`.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        summarizer: Arc<ModelHandle>,
        embedder: Option<Arc<ModelHandle>>,
        estimator: ResourceEstimator,
        settings: SummarizerSettings,
    ) -> Self {
        Self {
            backend,
            chunker: TextChunker::for_model(&summarizer),
            summarizer,
            embedder,
            estimator,
            settings,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Report chunk and model-call counts into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Token budget for one chunk: the live context budget minus the prompt reserve.
    pub fn chunk_budget(&self) -> usize {
        self.estimator
            .max_context_tokens(&self.summarizer)
            .saturating_sub(self.settings.prompt_reserve_tokens)
            .max(1)
    }

    /// Summarize `text` by map-reduce. Empty input returns an empty string without model calls.
    pub async fn summarize_flat(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }

        let budget = self.chunk_budget();
        let chunks = match self
            .chunker
            .split(text, budget, self.settings.overlap_tokens, 1)
        {
            Ok(chunks) => chunks,
            Err(error) => {
                tracing::warn!(error = %error, budget, "Chunking failed; skipping summary");
                return String::new();
            }
        };

        tracing::debug!(
            chunks = chunks.len(),
            budget,
            model = %self.summarizer.serving_name,
            "Summarizing text"
        );
        let summaries = self.map_chunks(&chunks, MAP_PROMPT).await;
        self.reduce(summaries, budget).await
    }

    /// Summarize every node reachable from `root` in post-order, embedding each node's text
    /// when an embedder is configured.
    ///
    /// Missing references and cycles are logged and skipped; they never abort the walk.
    pub async fn summarize_tree(
        &self,
        tree: &DocumentTree,
        root: &str,
    ) -> BTreeMap<String, NodeSummary> {
        self.walk(tree, root, true).await
    }

    async fn walk(
        &self,
        tree: &DocumentTree,
        root: &str,
        embed: bool,
    ) -> BTreeMap<String, NodeSummary> {
        let mut results: BTreeMap<String, NodeSummary> = BTreeMap::new();
        let mut in_progress: HashSet<String> = HashSet::new();
        let mut stack = vec![Visit::Enter(root.to_string())];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(id) => {
                    if results.contains_key(&id) {
                        continue;
                    }
                    if in_progress.contains(&id) {
                        tracing::warn!(node_id = %id, "Cyclic node reference; skipping");
                        continue;
                    }
                    let Some(node) = tree.node(&id) else {
                        tracing::warn!(node_id = %id, "Unresolvable node reference; skipping");
                        continue;
                    };
                    stack.push(Visit::Exit(id.clone()));
                    stack.extend(
                        node.children
                            .iter()
                            .rev()
                            .map(|child| Visit::Enter(child.clone())),
                    );
                    in_progress.insert(id);
                }
                Visit::Exit(id) => {
                    in_progress.remove(&id);
                    let Some(node) = tree.node(&id) else {
                        continue;
                    };
                    let summary = self.summarize_node(node, &results, embed).await;
                    results.insert(id, summary);
                }
            }
        }

        results
    }

    /// Summarize a whole document; the root's children summary becomes the result.
    ///
    /// Only the root text survives, so no embeddings are computed on this path.
    pub async fn summarize_document(&self, tree: &DocumentTree, node_id: &str) -> SummaryResult {
        let results = self.walk(tree, tree.root(), false).await;
        let text = results
            .get(tree.root())
            .and_then(|root| {
                root.children_summary
                    .as_deref()
                    .or(root.raw_text.as_deref())
            })
            .unwrap_or_default()
            .to_string();

        tracing::info!(
            node_id,
            nodes = results.len(),
            summary_chars = text.len(),
            "Document summarized"
        );
        SummaryResult {
            text,
            source_node_id: node_id.to_string(),
            nodes_summarized: results.len(),
        }
    }

    async fn summarize_node(
        &self,
        node: &ContentNode,
        results: &BTreeMap<String, NodeSummary>,
        embed: bool,
    ) -> NodeSummary {
        if let Some(text) = node.leaf_text() {
            let embedding = if embed { self.embed(text).await } else { None };
            return NodeSummary {
                raw_text: Some(text.to_string()),
                children_summary: None,
                embedding,
            };
        }

        let child_texts: Vec<&str> = node
            .children
            .iter()
            .filter_map(|child| results.get(child))
            .filter_map(NodeSummary::text)
            .collect();
        if child_texts.is_empty() {
            return NodeSummary::default();
        }

        let summary = self.summarize_flat(&child_texts.join("\n")).await;
        if summary.is_empty() {
            tracing::debug!(node_id = %node.self_ref, "Children produced no summary");
            return NodeSummary::default();
        }
        let embedding = if embed { self.embed(&summary).await } else { None };
        NodeSummary {
            raw_text: None,
            children_summary: Some(summary),
            embedding,
        }
    }

    /// Map each chunk to a summary, dropping failures and degenerate output.
    async fn map_chunks(&self, chunks: &[Chunk], template: &str) -> Vec<String> {
        self.metrics.record_chunks(chunks.len() as u64);
        let mut summaries = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let summary = self.generate(template, &chunk.text).await.unwrap_or_default();
            if summary.is_empty() || summary.chars().count() < self.settings.min_summary_chars {
                tracing::debug!(
                    chunk = index,
                    summary_chars = summary.chars().count(),
                    "Dropping degenerate chunk summary"
                );
                continue;
            }
            summaries.push(summary);
        }
        summaries
    }

    async fn reduce(&self, mut summaries: Vec<String>, budget: usize) -> String {
        for pass in 0..MAX_REDUCE_PASSES {
            match summaries.len() {
                0 => return String::new(),
                1 => return summaries.remove(0),
                _ => {}
            }

            let joined = summaries.join(&self.settings.separator);
            let tokens = self.chunker.count_tokens(&joined);
            if tokens <= budget {
                return self.final_summary(&joined, budget).await;
            }

            tracing::debug!(pass, tokens, budget, "Joined summaries exceed budget; reducing again");
            let split = self
                .chunker
                .split(&joined, budget, self.settings.overlap_tokens, 1);
            let Ok(chunks) = split else {
                return self.final_summary(&joined, budget).await;
            };
            let next = self.map_chunks(&chunks, REDUCE_PROMPT).await;
            let next_tokens = self.chunker.count_tokens(&next.join(&self.settings.separator));
            if next_tokens >= tokens {
                tracing::warn!(
                    pass,
                    tokens,
                    next_tokens,
                    "Reduce pass did not shrink the text; truncating"
                );
                return self.final_summary(&joined, budget).await;
            }
            summaries = next;
        }

        let joined = summaries.join(&self.settings.separator);
        tracing::warn!(
            passes = MAX_REDUCE_PASSES,
            "Reduce pass limit reached; truncating"
        );
        self.final_summary(&joined, budget).await
    }

    /// One reduce call over `joined`, truncated to `budget` at a word boundary first.
    async fn final_summary(&self, joined: &str, budget: usize) -> String {
        let input = self.truncate_to_budget(joined, budget);
        match self.generate(REDUCE_PROMPT, &input).await {
            Some(summary) if !summary.trim().is_empty() => summary,
            _ => input,
        }
    }

    fn truncate_to_budget(&self, text: &str, budget: usize) -> String {
        match self.chunker.split(text, budget, 0, 1) {
            Ok(chunks) => chunks
                .into_iter()
                .next()
                .map(|chunk| chunk.text.trim_end().to_string())
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    async fn generate(&self, template: &str, text: &str) -> Option<String> {
        let prompt = template.replace("{text}", text);
        let request = GenerateRequest::for_model(&self.summarizer, prompt, SUMMARY_TEMPERATURE);
        self.metrics.record_model_call();
        match self.backend.generate(request).await {
            Ok(summary) => Some(summary.trim().to_string()),
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    model = %self.summarizer.serving_name,
                    "Summary generation failed"
                );
                None
            }
        }
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        self.metrics.record_model_call();
        match self
            .backend
            .embed(&embedder.serving_name, vec![text.to_string()])
            .await
        {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(error = %error, model = %embedder.serving_name, "Embedding failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, declared_limit_estimator, model};
    use crate::resources::Capability;

    fn settings(min_summary_chars: usize) -> SummarizerSettings {
        SummarizerSettings {
            prompt_reserve_tokens: 0,
            min_summary_chars,
            overlap_tokens: 0,
            separator: " -- ".to_string(),
        }
    }

    fn summarizer(
        backend: Arc<FakeBackend>,
        max_input_tokens: usize,
        min_summary_chars: usize,
    ) -> HierarchicalSummarizer {
        HierarchicalSummarizer::new(
            backend,
            model(Capability::Summarizer, max_input_tokens),
            Some(model(Capability::Embedder, 512)),
            declared_limit_estimator(),
            settings(min_summary_chars),
        )
    }

    #[tokio::test]
    async fn empty_input_skips_the_model() {
        let backend = Arc::new(FakeBackend::digest());
        let summary = summarizer(backend.clone(), 64, 0).summarize_flat("").await;
        assert_eq!(summary, "");
        assert_eq!(backend.generate_calls(), 0);

        let summary = summarizer(backend.clone(), 64, 0).summarize_flat("  \n ").await;
        assert_eq!(summary, "");
        assert_eq!(backend.generate_calls(), 0);
    }

    #[tokio::test]
    async fn single_chunk_returns_its_map_summary() {
        let backend = Arc::new(FakeBackend::constant("a short account of the text"));
        let summary = summarizer(backend.clone(), 64, 5)
            .summarize_flat("one two three")
            .await;
        assert_eq!(summary, "a short account of the text");
        assert_eq!(backend.generate_calls(), 1);
        assert!(
            backend.prompts()[0].starts_with("Write a concise summary of the following text:\n")
        );
    }

    #[tokio::test]
    async fn multiple_chunks_are_reduced_with_separator() {
        let backend = Arc::new(FakeBackend::constant("partial summary"));
        let text = "word ".repeat(40);
        // 40 words against a 20 token prompt budget: 2 map calls plus one reduce.
        let summary = summarizer(backend.clone(), 20, 5).summarize_flat(&text).await;
        assert_eq!(summary, "partial summary");

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 3);
        let reduce = prompts.last().expect("reduce prompt");
        assert!(reduce.starts_with("Write a concise summary of the following summaries:\n"));
        assert!(reduce.contains("partial summary -- partial summary"));
    }

    #[tokio::test]
    async fn degenerate_summaries_are_dropped() {
        let backend = Arc::new(FakeBackend::constant("ok"));
        let summary = summarizer(backend.clone(), 64, 20)
            .summarize_flat("some text worth summarizing")
            .await;
        assert_eq!(summary, "");
        assert_eq!(backend.generate_calls(), 1);
    }

    #[tokio::test]
    async fn failing_backend_yields_empty_summary() {
        let backend = Arc::new(FakeBackend::failing());
        let summary = summarizer(backend.clone(), 4, 0)
            .summarize_flat("alpha beta gamma delta epsilon zeta eta theta")
            .await;
        assert_eq!(summary, "");
    }

    #[tokio::test]
    async fn oversized_reduction_is_chunked_again() {
        // Each map summary is four words; twelve of them joined exceed the 10 token budget.
        let backend = Arc::new(FakeBackend::constant("four words of summary"));
        let text = "w ".repeat(120);
        let summary = summarizer(backend.clone(), 10, 5).summarize_flat(&text).await;
        assert_eq!(summary, "four words of summary");
        assert!(
            backend
                .prompts()
                .iter()
                .any(|prompt| prompt.contains("following summaries"))
        );
    }

    #[tokio::test]
    async fn non_shrinking_reduction_truncates_to_budget() {
        // Summaries as long as their input never shrink; the reducer must still terminate.
        let backend = Arc::new(FakeBackend::new(|request| {
            Ok(request
                .prompt
                .lines()
                .nth(1)
                .unwrap_or_default()
                .to_string())
        }));
        let text = (0..60).map(|n| format!("w{n} ")).collect::<String>();
        let summary = summarizer(backend.clone(), 10, 1).summarize_flat(&text).await;
        assert!(!summary.is_empty());
        assert!(summary.split_whitespace().count() <= 10);
    }

    #[tokio::test]
    async fn single_leaf_tree_summarizes_into_root() {
        let backend = Arc::new(FakeBackend::digest());
        let tree = DocumentTree::new(
            "#/body",
            [
                ContentNode::group("#/body", ["#/texts/0"]),
                ContentNode::leaf("#/texts/0", "hello"),
            ],
        );
        let results = summarizer(backend.clone(), 64, 0)
            .summarize_tree(&tree, "#/body")
            .await;

        let expected = summarizer(Arc::new(FakeBackend::digest()), 64, 0)
            .summarize_flat("hello")
            .await;
        let root = results.get("#/body").expect("root");
        assert_eq!(root.raw_text, None);
        assert_eq!(root.children_summary.as_deref(), Some(expected.as_str()));
        assert!(root.embedding.is_some());

        let leaf = results.get("#/texts/0").expect("leaf");
        assert_eq!(leaf.raw_text.as_deref(), Some("hello"));
        assert_eq!(leaf.children_summary, None);
        assert_eq!(backend.embedded()[0], "hello");
    }

    #[tokio::test]
    async fn missing_references_are_skipped() {
        let backend = Arc::new(FakeBackend::constant("summary of the section"));
        let tree = DocumentTree::new(
            "#/body",
            [
                ContentNode::group("#/body", ["#/groups/0", "#/texts/404"]),
                ContentNode::group("#/groups/0", ["#/texts/0", "#/texts/1"]),
                ContentNode::leaf("#/texts/0", "first paragraph"),
                ContentNode::leaf("#/texts/1", "second paragraph"),
            ],
        );
        let results = summarizer(backend.clone(), 64, 0)
            .summarize_tree(&tree, "#/body")
            .await;

        assert_eq!(results.len(), 4);
        assert!(!results.contains_key("#/texts/404"));
        assert_eq!(
            results["#/groups/0"].children_summary.as_deref(),
            Some("summary of the section")
        );
        assert!(backend.prompts()[0].contains("first paragraph\nsecond paragraph"));
    }

    #[tokio::test]
    async fn cyclic_references_terminate() {
        let backend = Arc::new(FakeBackend::constant("looped summary"));
        let tree = DocumentTree::new(
            "a",
            [
                ContentNode::group("a", ["b"]),
                ContentNode::group("b", ["a", "c"]),
                ContentNode::leaf("c", "leaf text"),
            ],
        );
        let results = summarizer(backend, 64, 0).summarize_tree(&tree, "a").await;
        assert_eq!(results.len(), 3);
        assert_eq!(results["a"].children_summary.as_deref(), Some("looped summary"));
    }

    #[tokio::test]
    async fn document_summary_comes_from_root() {
        let backend = Arc::new(FakeBackend::constant("the whole document"));
        let tree = DocumentTree::new(
            "#/body",
            [
                ContentNode::group("#/body", ["#/texts/0", "#/texts/1"]),
                ContentNode::leaf("#/texts/0", "intro"),
                ContentNode::leaf("#/texts/1", ""),
            ],
        );
        let result = summarizer(backend.clone(), 64, 0)
            .summarize_document(&tree, "node-7")
            .await;
        assert_eq!(result.text, "the whole document");
        assert_eq!(result.source_node_id, "node-7");
        assert_eq!(result.nodes_summarized, 3);
        assert!(backend.embedded().is_empty());
    }

    #[tokio::test]
    async fn tree_embeds_every_summarized_node() {
        let backend = Arc::new(FakeBackend::constant("the whole document"));
        let tree = DocumentTree::new(
            "#/body",
            [
                ContentNode::group("#/body", ["#/texts/0", "#/texts/1"]),
                ContentNode::leaf("#/texts/0", "intro"),
                ContentNode::leaf("#/texts/1", "body text"),
            ],
        );
        let results = summarizer(backend.clone(), 64, 0)
            .summarize_tree(&tree, "#/body")
            .await;
        assert!(results.values().all(|node| node.embedding.is_some()));
        assert_eq!(
            backend.embedded(),
            vec!["intro", "body text", "the whole document"]
        );
    }

    #[tokio::test]
    async fn leaf_raw_text_is_not_trimmed() {
        let backend = Arc::new(FakeBackend::constant("a summary"));
        let tree = DocumentTree::new(
            "#/body",
            [
                ContentNode::group("#/body", ["#/texts/0"]),
                ContentNode::leaf("#/texts/0", "  - bullet item\n"),
            ],
        );
        let results = summarizer(backend, 64, 0).summarize_tree(&tree, "#/body").await;
        assert_eq!(
            results["#/texts/0"].raw_text.as_deref(),
            Some("  - bullet item\n")
        );
    }
}
