use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use super::{DocumentNode, StructureSource};
use crate::summarize::{DocumentTree, StructureError};

/// Reads structure trees that the conversion service writes as `<dir>/<node id>.json`.
///
/// Keying by node id keeps files that share a name in different folders apart.
#[derive(Debug, Clone)]
pub struct DirectoryStructureSource {
    dir: PathBuf,
}

impl DirectoryStructureSource {
    /// Source reading from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where the tree for `node` is expected. Ids that are not a single path component have
    /// no tree location.
    pub fn tree_path(&self, node: &DocumentNode) -> Option<PathBuf> {
        let id = node.id.as_str();
        let single_component = matches!(
            Path::new(id).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        );
        if !single_component || id.contains(['/', '\\']) {
            tracing::warn!(
                node_id = %id,
                path = %node.path,
                "Node id cannot name a structure file"
            );
            return None;
        }
        Some(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl StructureSource for DirectoryStructureSource {
    async fn load(&self, node: &DocumentNode) -> Result<Option<DocumentTree>, StructureError> {
        let Some(path) = self.tree_path(node) else {
            return Ok(None);
        };
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), node_id = %node.id, "No structure tree");
                return Ok(None);
            }
            Err(source) => return Err(StructureError::Io { path, source }),
        };
        DocumentTree::from_json(&raw).map(Some)
    }
}
