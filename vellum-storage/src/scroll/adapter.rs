//! Record to node adapters, keyed by document type.

use std::collections::HashMap;
use std::fmt;
use vellum_core::{DocumentRecord, Node, NodeKind};

/// Builds a node from a record and its already adapted parent.
pub type NodeConstructor = fn(&DocumentRecord, Option<&Node>) -> Node;

fn folder(record: &DocumentRecord, parent: Option<&Node>) -> Node {
    Node::adapt(record, parent, NodeKind::Folder)
}

fn file(record: &DocumentRecord, parent: Option<&Node>) -> Node {
    Node::adapt(record, parent, NodeKind::File)
}

/// Type tag to node constructor table.
///
/// Fixed when the repository is configured. Records whose type has no entry
/// cannot be adapted and are left out of scroll results.
#[derive(Clone, Default)]
pub struct NodeAdapterRegistry {
    constructors: HashMap<String, NodeConstructor>,
}

impl NodeAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folder-like types adapt to folders, content types to files.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for tag in ["Root", "Domain", "Workspace", "Section", "Folder"] {
            registry.register(tag, folder);
        }
        for tag in ["File", "Note", "Picture"] {
            registry.register(tag, file);
        }
        registry
    }

    pub fn register(&mut self, doc_type: impl Into<String>, constructor: NodeConstructor) -> &mut Self {
        self.constructors.insert(doc_type.into(), constructor);
        self
    }

    pub fn supports(&self, doc_type: &str) -> bool {
        self.constructors.contains_key(doc_type)
    }

    pub fn adapt(&self, record: &DocumentRecord, parent: Option<&Node>) -> Option<Node> {
        self.constructors
            .get(&record.doc_type)
            .map(|construct| construct(record, parent))
    }
}

impl fmt::Debug for NodeAdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("NodeAdapterRegistry").field("types", &types).finish()
    }
}
