//! Parent linkage for scroll batches.
//!
//! Each fetched record is adapted under its resolved parent node. Parents
//! are looked up in a cache scoped to one [`AncestorResolver::adapt`] call,
//! seeded with the scroll's container. Missing ancestors are fetched from
//! the store walking upwards with an explicit chain, never recursion, and
//! every folder resolved on the way is cached for later siblings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vellum_core::{DocumentId, DocumentRecord, Node, Principal, ScrollError, VellumResult};

use super::adapter::NodeAdapterRegistry;
use crate::RecordStore;

/// Nodes adapted from one batch of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptedBatch {
    pub nodes: Vec<Node>,
    /// Records left out because they or an ancestor are invisible, orphaned
    /// or of an unknown type.
    pub skipped: usize,
}

/// Call-scoped walk state.
struct Walk {
    container_id: DocumentId,
    ancestors: HashMap<DocumentId, Arc<Node>>,
    /// Ids known to have an invisible or broken ancestor chain.
    unreachable: HashSet<DocumentId>,
}

impl Walk {
    fn new(container: &Node) -> Self {
        let mut ancestors = HashMap::new();
        ancestors.insert(container.id.clone(), Arc::new(container.clone()));
        Self {
            container_id: container.id.clone(),
            ancestors,
            unreachable: HashSet::new(),
        }
    }

    fn cut_off(&mut self, ids: impl IntoIterator<Item = DocumentId>) {
        self.unreachable.extend(ids);
    }
}

/// Adapts records into nodes with their parent chain resolved.
pub struct AncestorResolver<S: RecordStore> {
    store: Arc<S>,
    adapters: Arc<NodeAdapterRegistry>,
}

impl<S: RecordStore> AncestorResolver<S> {
    pub fn new(store: Arc<S>, adapters: Arc<NodeAdapterRegistry>) -> Self {
        Self { store, adapters }
    }

    pub fn adapters(&self) -> &NodeAdapterRegistry {
        &self.adapters
    }

    /// Adapt `records`, all expected to live under `container`.
    ///
    /// Records `principal` cannot read, or whose ancestor chain it cannot
    /// read, are skipped and counted. A record whose chain reaches the
    /// repository root without passing through `container` is a structural
    /// error, as is a cycle in the chain.
    pub async fn adapt(
        &self,
        records: Vec<DocumentRecord>,
        container: &Node,
        principal: &Principal,
    ) -> VellumResult<AdaptedBatch> {
        let mut walk = Walk::new(container);
        let mut batch = AdaptedBatch::default();

        for record in records {
            if !record.acl.permits(principal) {
                tracing::debug!(document_id = %record.id, "Skipping unreadable record");
                walk.cut_off([record.id]);
                batch.skipped += 1;
                continue;
            }

            let Some(parent) = self.resolve_parent(&mut walk, &record, principal).await? else {
                walk.cut_off([record.id]);
                batch.skipped += 1;
                continue;
            };

            let Some(node) = self.adapters.adapt(&record, Some(&parent)) else {
                tracing::warn!(
                    document_id = %record.id,
                    doc_type = %record.doc_type,
                    "No node adapter for document type"
                );
                batch.skipped += 1;
                continue;
            };
            if node.is_folder() {
                walk.ancestors.insert(record.id.clone(), Arc::new(node.clone()));
            }
            batch.nodes.push(node);
        }
        Ok(batch)
    }

    /// Adapted parent of `record`, or `None` if the chain is unreachable.
    async fn resolve_parent(
        &self,
        walk: &mut Walk,
        record: &DocumentRecord,
        principal: &Principal,
    ) -> VellumResult<Option<Arc<Node>>> {
        let container_id = walk.container_id.clone();
        let not_a_descendant = || ScrollError::NotADescendant {
            document_id: record.id.clone(),
            container_id: container_id.clone(),
        };
        let Some(mut parent_id) = record.parent_id.clone() else {
            tracing::error!(document_id = %record.id, "Repository root listed as descendant");
            return Err(not_a_descendant().into());
        };

        // Unresolved ancestors, nearest first
        let mut chain: Vec<DocumentRecord> = Vec::new();
        let mut seen: HashSet<DocumentId> = HashSet::from([record.id.clone()]);

        let base = loop {
            if let Some(node) = walk.ancestors.get(&parent_id) {
                break node.clone();
            }
            if walk.unreachable.contains(&parent_id) {
                walk.cut_off(chain.into_iter().map(|a| a.id));
                return Ok(None);
            }
            if !seen.insert(parent_id.clone()) {
                tracing::error!(document_id = %record.id, at = %parent_id, "Ancestor cycle");
                return Err(ScrollError::AncestorCycle {
                    document_id: record.id.clone(),
                }
                .into());
            }

            let parent = match self.store.fetch(&parent_id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => {
                    tracing::warn!(document_id = %record.id, missing = %parent_id, "Orphaned record skipped");
                    walk.cut_off(std::iter::once(parent_id).chain(chain.into_iter().map(|a| a.id)));
                    return Ok(None);
                }
                Err(e) if e.is_access_denied() => {
                    tracing::warn!(document_id = %record.id, ancestor = %parent_id, "Invisible ancestor, record skipped");
                    walk.cut_off(std::iter::once(parent_id).chain(chain.into_iter().map(|a| a.id)));
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if !parent.acl.permits(principal) {
                tracing::warn!(document_id = %record.id, ancestor = %parent.id, "Invisible ancestor, record skipped");
                walk.cut_off(std::iter::once(parent.id).chain(chain.into_iter().map(|a| a.id)));
                return Ok(None);
            }

            let Some(grandparent_id) = parent.parent_id.clone() else {
                tracing::error!(
                    document_id = %record.id,
                    container = %container_id,
                    "Ancestor chain reached the root without the container"
                );
                return Err(not_a_descendant().into());
            };
            chain.push(parent);
            parent_id = grandparent_id;
        };

        let mut current = base;
        while let Some(ancestor) = chain.pop() {
            match self.adapters.adapt(&ancestor, Some(&current)) {
                Some(node) if node.is_folder() => {
                    let node = Arc::new(node);
                    walk.ancestors.insert(ancestor.id, node.clone());
                    current = node;
                }
                _ => {
                    tracing::warn!(
                        document_id = %record.id,
                        ancestor = %ancestor.id,
                        doc_type = %ancestor.doc_type,
                        "Ancestor is not a folder, record skipped"
                    );
                    walk.cut_off(std::iter::once(ancestor.id).chain(chain.into_iter().map(|a| a.id)));
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }
}
