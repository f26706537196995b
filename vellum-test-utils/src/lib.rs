//! Vellum Test Utilities
//!
//! Shared test infrastructure for the Vellum workspace:
//! - Tree fixtures over the in-memory record store
//! - Proptest generators for tree shapes and invalidations
//! - Scroll helpers and custom assertions

pub use vellum_storage::InMemoryRecordStore;

pub use vellum_core::{
    AclSnapshot, DocumentFlags, DocumentId, DocumentRecord, InvalidationMessage, Node, Principal,
    RepositoryDescriptor, ScrollError, ScrollToken, StorageError, VellumError, VellumResult,
};
pub use vellum_storage::{RecordStore, ScrollCoordinator, ScrollPage};

use std::sync::Arc;
use std::time::Duration;

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for repository shapes and messages.

    use super::*;
    use proptest::prelude::*;
    use proptest::sample::Index;

    /// Parent table of a random tree below a container.
    ///
    /// Entry `i` is the parent of node `i + 1`; `0` is the container.
    pub fn arb_tree_shape(max_nodes: usize) -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(any::<Index>(), 0..=max_nodes).prop_map(|picks| {
            picks
                .iter()
                .enumerate()
                .map(|(i, pick)| pick.index(i + 1))
                .collect()
        })
    }

    pub fn arb_batch_size(max: usize) -> impl Strategy<Value = usize> {
        1..=max.max(1)
    }

    pub fn arb_document_id() -> impl Strategy<Value = DocumentId> {
        "[a-z0-9]{1,12}".prop_map(DocumentId::from)
    }

    pub fn arb_invalidation(node_id: &'static str) -> impl Strategy<Value = InvalidationMessage> {
        (arb_document_id(), any::<bool>()).prop_map(move |(id, deleted)| {
            if deleted {
                InvalidationMessage::deleted(id, node_id)
            } else {
                InvalidationMessage::modified(id, node_id)
            }
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built repository trees.

    use super::*;

    /// A store holding `/` and a `/container` workspace with descendants.
    pub struct TreeFixture {
        pub store: Arc<InMemoryRecordStore>,
        pub root: DocumentRecord,
        pub container: DocumentRecord,
        /// Every listable descendant of the container.
        pub descendants: Vec<DocumentId>,
    }

    impl TreeFixture {
        fn empty(
            store: InMemoryRecordStore,
        ) -> VellumResult<(InMemoryRecordStore, DocumentRecord, DocumentRecord)> {
            let root = DocumentRecord::root(DocumentId::from("root"));
            let container = DocumentRecord::child_of(&root, "container", "Workspace");
            store.insert(root.clone())?;
            store.insert(container.clone())?;
            Ok((store, root, container))
        }

        /// `n` files directly under the container.
        pub fn flat(n: usize) -> VellumResult<Self> {
            Self::from_parents(&vec![0; n])
        }

        /// `folders` folders of `files` files each.
        pub fn nested(folders: usize, files: usize) -> VellumResult<Self> {
            let mut parents = Vec::with_capacity(folders * (files + 1));
            for _ in 0..folders {
                let folder = parents.len() + 1;
                parents.push(0);
                parents.extend(std::iter::repeat(folder).take(files));
            }
            Self::from_parents(&parents)
        }

        /// Tree from a parent table (see [`generators::arb_tree_shape`]).
        ///
        /// Nodes with children are folders, the rest are files.
        pub fn from_parents(parents: &[usize]) -> VellumResult<Self> {
            Self::from_parents_in(InMemoryRecordStore::new(), parents)
        }

        pub fn from_parents_in(store: InMemoryRecordStore, parents: &[usize]) -> VellumResult<Self> {
            let (store, root, container) = Self::empty(store)?;
            let has_children: Vec<bool> = (0..=parents.len())
                .map(|node| parents.contains(&node))
                .collect();

            let mut records: Vec<DocumentRecord> = vec![container.clone()];
            for (i, &parent) in parents.iter().enumerate() {
                let node = i + 1;
                let doc_type = if has_children[node] { "Folder" } else { "File" };
                let record = DocumentRecord::child_of(&records[parent], format!("node-{node}"), doc_type);
                records.push(record);
            }

            let mut descendants = Vec::with_capacity(parents.len());
            for record in records.into_iter().skip(1) {
                descendants.push(record.id.clone());
                store.insert(record)?;
            }

            Ok(Self {
                store: Arc::new(store),
                root,
                container,
                descendants,
            })
        }

        /// Add a record restricted to `reader` directly under the container.
        pub fn add_restricted(
            &mut self,
            name: &str,
            doc_type: &str,
            reader: &str,
        ) -> VellumResult<DocumentRecord> {
            let record = DocumentRecord::child_of(&self.container, name, doc_type)
                .with_acl(AclSnapshot::restricted([reader]));
            self.store.insert(record.clone())?;
            self.descendants.push(record.id.clone());
            Ok(record)
        }
    }

    /// Descriptor with background sweeps off, for deterministic tests.
    pub fn quiet_descriptor(name: &str) -> RepositoryDescriptor {
        let mut descriptor = RepositoryDescriptor::new(name);
        descriptor.cache.sweep_interval_secs = 0;
        descriptor
    }

    /// Descriptor joining the in-process `"broadcast"` cluster as `node_id`.
    pub fn clustered_descriptor(name: &str, node_id: &str) -> RepositoryDescriptor {
        let mut descriptor = quiet_descriptor(name);
        descriptor.cluster.enabled = true;
        descriptor.cluster.node_id = node_id.to_string();
        descriptor.cluster.invalidator = Some("broadcast".to_string());
        descriptor.cluster.poll_interval_ms = 10;
        descriptor
    }
}

// ============================================================================
// SCROLL HELPERS
// ============================================================================

/// Run a scroll to the end and return every page, the final empty one
/// included.
///
/// Gives up after `max_pages` pages so a broken cursor cannot hang a test.
pub async fn drain_scroll<S: RecordStore>(
    coordinator: &ScrollCoordinator<S>,
    principal: &Principal,
    container: &DocumentId,
    batch_size: usize,
    max_pages: usize,
) -> VellumResult<Vec<ScrollPage>> {
    let mut pages = Vec::new();
    let mut token = ScrollToken::empty();
    for _ in 0..max_pages {
        let page = coordinator
            .scroll(principal, container, &token, batch_size, Duration::ZERO)
            .await?;
        token = page.scroll_token.clone();
        let end = page.is_end();
        pages.push(page);
        if end {
            break;
        }
    }
    Ok(pages)
}

/// Ids of every item across `pages`, in delivery order.
pub fn delivered_ids(pages: &[ScrollPage]) -> Vec<DocumentId> {
    pages
        .iter()
        .flat_map(|p| p.items.iter().map(|n| n.id.clone()))
        .collect()
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Vellum-specific results.

    use super::*;

    #[track_caller]
    pub fn assert_scroll_error<T: std::fmt::Debug>(result: &VellumResult<T>, expected: &ScrollError) {
        match result {
            Err(VellumError::Scroll(actual)) => assert_eq!(actual, expected),
            other => panic!("Expected scroll error {expected:?}, got: {other:?}"),
        }
    }

    #[track_caller]
    pub fn assert_access_denied<T: std::fmt::Debug>(result: &VellumResult<T>) {
        match result {
            Err(e) if e.is_access_denied() => {}
            other => panic!("Expected AccessDenied, got: {other:?}"),
        }
    }

    /// Every id appears exactly once.
    #[track_caller]
    pub fn assert_exactly_once(delivered: &[DocumentId], expected: &[DocumentId]) {
        let mut delivered = delivered.to_vec();
        let mut expected = expected.to_vec();
        delivered.sort();
        expected.sort();
        assert_eq!(delivered, expected, "delivered ids differ from the expected set");
    }
}
