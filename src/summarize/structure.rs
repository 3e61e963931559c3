//! Document structure trees produced by the conversion service.
//!
//! The converted document is a JSON object with a `body` node and flat arrays of `groups`,
//! `texts`, `pictures` and `tables`. Every node names itself through `self_ref` (for example
//! `#/texts/3`) and points at its children with `{"$ref": ...}` objects. The tree is loaded into an
//! arena keyed by `self_ref`; dangling references are kept as-is and skipped during traversal.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a structure tree.
#[derive(Debug, Error)]
pub enum StructureError {
    /// Structure file could not be read.
    #[error("failed to read structure file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Structure document is not valid JSON or lacks a body.
    #[error("malformed structure document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Node within a converted document tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentNode {
    /// Pointer identifying the node, e.g. `#/texts/0`.
    pub self_ref: String,
    /// Leaf text, if any.
    pub text: Option<String>,
    /// Ordered child references.
    pub children: Vec<String>,
}

impl ContentNode {
    /// Leaf node carrying `text`.
    pub fn leaf(self_ref: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            self_ref: self_ref.into(),
            text: Some(text.into()),
            children: Vec::new(),
        }
    }

    /// Internal node referencing `children`.
    pub fn group<I, S>(self_ref: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            self_ref: self_ref.into(),
            text: None,
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    /// Leaf text as stored, unless it is blank.
    pub fn leaf_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

/// Arena of content nodes keyed by `self_ref`.
#[derive(Debug, Clone, Default)]
pub struct DocumentTree {
    root: String,
    nodes: HashMap<String, ContentNode>,
}

#[derive(Deserialize)]
struct RawDocument {
    body: RawNode,
    #[serde(default)]
    groups: Vec<RawNode>,
    #[serde(default)]
    texts: Vec<RawNode>,
    #[serde(default)]
    pictures: Vec<RawNode>,
    #[serde(default)]
    tables: Vec<RawNode>,
}

#[derive(Deserialize)]
struct RawNode {
    self_ref: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    children: Vec<RawRef>,
}

#[derive(Deserialize)]
struct RawRef {
    #[serde(rename = "$ref")]
    target: String,
}

impl From<RawNode> for ContentNode {
    fn from(raw: RawNode) -> Self {
        Self {
            self_ref: raw.self_ref,
            text: raw.text,
            children: raw.children.into_iter().map(|child| child.target).collect(),
        }
    }
}

impl DocumentTree {
    /// Build a tree rooted at `root` from `nodes`. Later duplicates of a `self_ref` are ignored.
    pub fn new(root: impl Into<String>, nodes: impl IntoIterator<Item = ContentNode>) -> Self {
        let mut arena = HashMap::new();
        for node in nodes {
            if arena.contains_key(&node.self_ref) {
                tracing::warn!(node_id = %node.self_ref, "Duplicate node reference; keeping first");
                continue;
            }
            arena.insert(node.self_ref.clone(), node);
        }
        Self {
            root: root.into(),
            nodes: arena,
        }
    }

    /// Parse the conversion service's JSON export.
    pub fn from_json(raw: &str) -> Result<Self, StructureError> {
        let document: RawDocument = serde_json::from_str(raw)?;
        let root = document.body.self_ref.clone();
        let nodes = std::iter::once(document.body)
            .chain(document.groups)
            .chain(document.texts)
            .chain(document.pictures)
            .chain(document.tables)
            .map(ContentNode::from);
        Ok(Self::new(root, nodes))
    }

    /// Identifier of the root node.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Look up a node by reference.
    pub fn node(&self, id: &str) -> Option<&ContentNode> {
        self.nodes.get(id)
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leaf texts reachable from `start`, in document order, joined by blank lines.
    pub fn plain_text(&self, start: &str) -> String {
        let mut texts = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![start.to_string()];

        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.node(&id) else {
                continue;
            };
            if let Some(text) = node.leaf_text() {
                texts.push(text.trim().to_string());
            }
            stack.extend(node.children.iter().rev().cloned());
        }

        texts.join("\n\n")
    }
}
