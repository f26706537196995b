//! Adapted tree nodes handed out to callers.

use serde::{Deserialize, Serialize};

use crate::document::{join_path, DocumentRecord};
use crate::identity::{DocumentId, Timestamp};

/// Shape of an adapted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Can hold children; cached as an ancestor during a scroll batch.
    Folder,
    /// Leaf content.
    File,
}

/// A record adapted into a tree node with its parent linkage resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: DocumentId,
    pub parent_id: Option<DocumentId>,
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    pub doc_type: String,
    pub modified_at: Timestamp,
}

impl Node {
    /// Adapt `record` as a node of the given kind.
    ///
    /// With a parent node, the path is rebuilt from the parent's path so that
    /// the linkage reflects the resolved chain rather than the stored path.
    pub fn adapt(record: &DocumentRecord, parent: Option<&Node>, kind: NodeKind) -> Self {
        let (parent_id, path) = match parent {
            Some(p) => (Some(p.id.clone()), join_path(&p.path, &record.name)),
            None => (record.parent_id.clone(), record.path.clone()),
        };
        Self {
            id: record.id.clone(),
            parent_id,
            name: record.name.clone(),
            path,
            kind,
            doc_type: record.doc_type.clone(),
            modified_at: record.modified_at,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapt_under_parent_rebuilds_path() {
        let root = DocumentRecord::root(DocumentId::from("root"));
        let folder = DocumentRecord::child_of(&root, "docs", "Folder");
        let file = DocumentRecord::child_of(&folder, "a.txt", "File");

        let folder_node = Node::adapt(&folder, None, NodeKind::Folder);
        let file_node = Node::adapt(&file, Some(&folder_node), NodeKind::File);

        assert!(folder_node.is_folder());
        assert!(!file_node.is_folder());
        assert_eq!(file_node.parent_id.as_ref(), Some(&folder.id));
        assert_eq!(file_node.path, "/docs/a.txt");
    }
}
