//! Vellum Storage - Record Store, Cache and Descendant Scroll
//!
//! Defines the backing-store abstraction ([`RecordStore`]) consumed by the
//! repository layer, an in-memory implementation used by tests and demos,
//! the read-through cache with cluster-aware invalidation ([`cache`]) and
//! the resumable descendant enumeration ([`scroll`]).

pub mod cache;
pub mod repository;
pub mod scroll;

pub use cache::{
    BroadcastClusterInvalidator, Cache, CacheFacade, CacheStats, CachingConnection, ChildKey,
    ClusterBus, ClusterInvalidator, InvalidationBatch, InvalidationPropagator,
    InvalidatorRegistry, MetricsSink, NoopMetricsSink, PrometheusMetricsSink, TtlCache,
};
pub use repository::{Repository, RepositoryServices, Session};
pub use scroll::{
    AdaptedBatch, AncestorResolver, ChunkedFetcher, NodeAdapterRegistry, ScrollCoordinator,
    ScrollPage, ScrollPhase, SearchContextCache,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use vellum_core::{DocumentId, DocumentRecord, StorageError, VellumResult};

// ============================================================================
// RECORD STORE TRAIT
// ============================================================================

/// Durable backing store keyed by document id.
///
/// Implementations must be safe to call concurrently. Queries and fetches see
/// every record regardless of access control; visibility is enforced by the
/// repository layer on top.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Whether connections get isolated read views.
    ///
    /// Transactional stores get per-connection caches instead of one shared
    /// cache, so that state visible to one connection never leaks to another.
    fn supports_transactions(&self) -> bool;

    /// Fetch one record by id.
    async fn fetch(&self, id: &DocumentId) -> VellumResult<Option<DocumentRecord>>;

    /// Fetch several records in one call.
    ///
    /// Ids that no longer resolve are omitted rather than reported.
    async fn fetch_many(&self, ids: &[DocumentId]) -> VellumResult<Vec<DocumentRecord>>;

    /// Ids of every listable descendant of `container_id`, direct or indirect.
    ///
    /// Trashed and hidden documents, versions and proxies are excluded. The
    /// order is stable and lists a parent before its children.
    async fn query_descendant_ids(&self, container_id: &DocumentId) -> VellumResult<Vec<DocumentId>>;

    /// Ids of the direct children of `parent_id`.
    async fn child_ids(&self, parent_id: &DocumentId) -> VellumResult<Vec<DocumentId>>;

    /// Resolve a child by name under `parent_id`.
    async fn find_child(&self, parent_id: &DocumentId, name: &str) -> VellumResult<Option<DocumentId>>;

    /// Create or overwrite a record.
    async fn save(&self, record: &DocumentRecord) -> VellumResult<()>;

    /// Delete a record and its whole subtree, returning every removed id.
    async fn delete(&self, id: &DocumentId) -> VellumResult<Vec<DocumentId>>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct Tree {
    records: HashMap<DocumentId, DocumentRecord>,
    /// Children in insertion order.
    children: HashMap<DocumentId, Vec<DocumentId>>,
}

impl Tree {
    fn link(&mut self, record: &DocumentRecord) {
        if let Some(parent) = &record.parent_id {
            let siblings = self.children.entry(parent.clone()).or_default();
            if !siblings.contains(&record.id) {
                siblings.push(record.id.clone());
            }
        }
    }

    fn unlink(&mut self, record: &DocumentRecord) {
        if let Some(parent) = &record.parent_id {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.retain(|id| id != &record.id);
            }
        }
    }

    /// Pre-order walk below `start`, excluding `start` itself.
    fn subtree(&self, start: &DocumentId) -> Vec<DocumentId> {
        let mut out = Vec::new();
        let mut stack: Vec<&DocumentId> = self
            .children
            .get(start)
            .map(|c| c.iter().rev().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            out.push(id.clone());
            if let Some(children) = self.children.get(id) {
                stack.extend(children.iter().rev());
            }
        }
        out
    }
}

/// In-memory record store for tests and demos.
///
/// Besides the [`RecordStore`] contract it counts backend calls, tracks the
/// peak number of concurrent calls and can inject latency or failures.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tree: RwLock<Tree>,
    transactional: bool,
    latency: RwLock<Option<Duration>>,
    fail_fetch_many: AtomicBool,
    fetch_calls: AtomicUsize,
    fetch_many_calls: AtomicUsize,
    descendant_queries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge when a backend call ends.
struct CallGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryRecordStore {
    /// Create a new non-transactional store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that reports transactional semantics.
    pub fn transactional() -> Self {
        Self {
            transactional: true,
            ..Self::default()
        }
    }

    /// Insert a record synchronously; used to seed fixtures.
    pub fn insert(&self, record: DocumentRecord) -> VellumResult<()> {
        let mut tree = self.tree.write().map_err(|_| StorageError::LockPoisoned)?;
        if tree.records.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists { id: record.id }.into());
        }
        tree.link(&record);
        tree.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Remove a single record without touching its children.
    ///
    /// Leaves dangling children behind; used to simulate concurrent removal
    /// between a descendant query and the fetch that follows it.
    pub fn remove_detached(&self, id: &DocumentId) -> VellumResult<Option<DocumentRecord>> {
        let mut tree = self.tree.write().map_err(|_| StorageError::LockPoisoned)?;
        let removed = tree.records.remove(id);
        if let Some(record) = &removed {
            tree.unlink(record);
        }
        Ok(removed)
    }

    /// Delay every backend call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.write() {
            *slot = latency;
        }
    }

    /// Make `fetch_many` fail until reset.
    pub fn set_fail_fetch_many(&self, fail: bool) {
        self.fail_fetch_many.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.tree.read().map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_many_calls(&self) -> usize {
        self.fetch_many_calls.load(Ordering::SeqCst)
    }

    pub fn descendant_queries(&self) -> usize {
        self.descendant_queries.load(Ordering::SeqCst)
    }

    /// Total number of backend calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.fetch_calls() + self.fetch_many_calls() + self.descendant_queries()
    }

    /// Peak number of backend calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> CallGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard {
            in_flight: &self.in_flight,
        };
        let latency = self.latency.read().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn read_tree(&self) -> VellumResult<std::sync::RwLockReadGuard<'_, Tree>> {
        Ok(self.tree.read().map_err(|_| StorageError::LockPoisoned)?)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn fetch(&self, id: &DocumentId) -> VellumResult<Option<DocumentRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        let tree = self.read_tree()?;
        Ok(tree.records.get(id).cloned())
    }

    async fn fetch_many(&self, ids: &[DocumentId]) -> VellumResult<Vec<DocumentRecord>> {
        self.fetch_many_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if self.fail_fetch_many.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                reason: "injected fetch_many failure".to_string(),
            }
            .into());
        }
        let tree = self.read_tree()?;
        Ok(ids
            .iter()
            .filter_map(|id| tree.records.get(id).cloned())
            .collect())
    }

    async fn query_descendant_ids(&self, container_id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
        self.descendant_queries.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        let tree = self.read_tree()?;
        Ok(tree
            .subtree(container_id)
            .into_iter()
            .filter(|id| tree.records.get(id).is_some_and(|r| r.is_listable()))
            .collect())
    }

    async fn child_ids(&self, parent_id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
        let tree = self.read_tree()?;
        Ok(tree.children.get(parent_id).cloned().unwrap_or_default())
    }

    async fn find_child(&self, parent_id: &DocumentId, name: &str) -> VellumResult<Option<DocumentId>> {
        let tree = self.read_tree()?;
        Ok(tree.children.get(parent_id).and_then(|children| {
            children
                .iter()
                .find(|id| tree.records.get(*id).is_some_and(|r| r.name == name))
                .cloned()
        }))
    }

    async fn save(&self, record: &DocumentRecord) -> VellumResult<()> {
        let mut tree = self.tree.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut record = record.clone();
        record.modified_at = chrono::Utc::now();
        if let Some(previous) = tree.records.get(&record.id).cloned() {
            if previous.parent_id != record.parent_id {
                tree.unlink(&previous);
            }
        }
        tree.link(&record);
        tree.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
        let mut tree = self.tree.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(record) = tree.records.get(id).cloned() else {
            return Err(StorageError::NotFound { id: id.clone() }.into());
        };
        let mut removed = vec![id.clone()];
        removed.extend(tree.subtree(id));
        tree.unlink(&record);
        for gone in &removed {
            tree.records.remove(gone);
            tree.children.remove(gone);
        }
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================
