//! Repository-level cache facade.
//!
//! The facade owns two caches per repository: `id -> record` and
//! `(parent, name) -> child id`. Where they live depends on the store:
//!
//! - Non-transactional stores share one cache pair across all connections.
//!   Writes evict in place.
//! - Transactional stores give each connection a private pair, so state
//!   visible to one connection never leaks into another. Other local
//!   connections learn about changes through an [`InvalidationPropagator`].
//!
//! With clustering enabled, every write is also published through the
//! configured [`ClusterInvalidator`], and messages from other nodes are
//! applied by [`CacheFacade::process_cluster_invalidations`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use vellum_core::{
    CacheDescriptor, ConfigError, DocumentId, DocumentRecord, InvalidationMessage,
    RepositoryDescriptor, StorageError, VellumResult,
};

use super::cluster::{ClusterInvalidator, InvalidatorRegistry};
use super::metrics::MetricsSink;
use super::propagator::{InvalidationBatch, InvalidationPropagator, InvalidationQueue};
use super::traits::{Cache, CacheStats};
use super::ttl::TtlCache;
use crate::RecordStore;

/// Capacity of the local propagator channel.
const PROPAGATOR_CAPACITY: usize = 1024;

/// Key of the child-name cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildKey {
    pub parent_id: DocumentId,
    pub name: String,
}

impl ChildKey {
    pub fn new(parent_id: DocumentId, name: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
        }
    }
}

// ============================================================================
// CACHE PAIR
// ============================================================================

/// Fill/evict bookkeeping of one cache pair.
#[derive(Debug)]
struct Ledger {
    /// Bumped by every eviction. A fill that read the store under an older
    /// value may hold a record the eviction meant to drop, and is discarded.
    generation: u64,
    /// Child-name keys by every id they mention, as parent or as target.
    related: HashMap<DocumentId, HashSet<ChildKey>>,
    tracked: usize,
    prune_at: usize,
}

impl Ledger {
    fn new(prune_floor: usize) -> Self {
        Self {
            generation: 0,
            related: HashMap::new(),
            tracked: 0,
            prune_at: prune_floor,
        }
    }

    fn track(&mut self, key: &ChildKey, child: &DocumentId) {
        for id in [&key.parent_id, child] {
            if self.related.entry(id.clone()).or_default().insert(key.clone()) {
                self.tracked += 1;
            }
        }
    }

    fn take(&mut self, id: &DocumentId) -> HashSet<ChildKey> {
        let keys = self.related.remove(id).unwrap_or_default();
        self.tracked = self.tracked.saturating_sub(keys.len());
        keys
    }

    /// Forget keys the child cache no longer holds.
    fn prune(&mut self, live: impl Fn(&ChildKey) -> bool, floor: usize) {
        self.related.retain(|_, keys| {
            keys.retain(|key| live(key));
            !keys.is_empty()
        });
        self.tracked = self.related.values().map(HashSet::len).sum();
        self.prune_at = self.tracked.saturating_mul(2).max(floor);
    }

    fn reset(&mut self, floor: usize) {
        self.generation += 1;
        self.related.clear();
        self.tracked = 0;
        self.prune_at = floor;
    }
}

/// The two caches of one scope (repository or connection).
///
/// Fills and evictions run under the ledger lock. Lookups do not.
#[derive(Debug)]
struct CachePair {
    state: Arc<TtlCache<DocumentId, Arc<DocumentRecord>>>,
    children: Arc<TtlCache<ChildKey, DocumentId>>,
    ledger: Mutex<Ledger>,
    prune_floor: usize,
}

impl CachePair {
    fn new(prefix: &str, descriptor: &CacheDescriptor) -> Self {
        // Every child key is tracked under two ids
        let prune_floor = descriptor.max_size.saturating_mul(4).max(64);
        Self {
            state: Arc::new(TtlCache::new(
                format!("{prefix}.state"),
                descriptor.ttl(),
                descriptor.max_size,
                descriptor.concurrency_level,
            )),
            children: Arc::new(TtlCache::new(
                format!("{prefix}.children"),
                descriptor.child_ttl(),
                descriptor.max_size,
                descriptor.concurrency_level,
            )),
            ledger: Mutex::new(Ledger::new(prune_floor)),
            prune_floor,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot to pass to [`Self::fill`] after reading the store.
    fn generation(&self) -> u64 {
        self.ledger().generation
    }

    /// Drop everything known about `id`: its record, the name entry that
    /// resolves to it and the name entries of its children.
    fn evict(&self, id: &DocumentId) -> usize {
        let mut ledger = self.ledger();
        ledger.generation += 1;
        let mut removed = usize::from(self.state.invalidate(id));
        for key in ledger.take(id) {
            removed += usize::from(self.children.invalidate(&key));
        }
        removed
    }

    fn clear(&self) {
        let mut ledger = self.ledger();
        ledger.reset(self.prune_floor);
        self.state.invalidate_all();
        self.children.invalidate_all();
    }

    fn apply(&self, batch: &InvalidationBatch) {
        if batch.flush {
            self.clear();
            return;
        }
        for message in &batch.messages {
            self.evict(&message.document_id);
        }
    }

    /// Cache a record read from the store, unless an eviction ran since
    /// `seen` was taken. Returns whether it was cached.
    fn fill(&self, record: Arc<DocumentRecord>, seen: u64) -> bool {
        let mut ledger = self.ledger();
        if ledger.generation != seen {
            return false;
        }
        self.insert(&mut ledger, record);
        true
    }

    /// Cache a name lookup read from the store, under the same rule as
    /// [`Self::fill`].
    fn fill_child(&self, key: ChildKey, child: DocumentId, seen: u64) -> bool {
        let mut ledger = self.ledger();
        if ledger.generation != seen {
            return false;
        }
        self.insert_child(&mut ledger, key, child);
        true
    }

    /// Cache a record unconditionally.
    fn remember(&self, record: Arc<DocumentRecord>) {
        let mut ledger = self.ledger();
        self.insert(&mut ledger, record);
    }

    fn insert(&self, ledger: &mut Ledger, record: Arc<DocumentRecord>) {
        if let Some(parent_id) = &record.parent_id {
            let key = ChildKey::new(parent_id.clone(), record.name.clone());
            self.insert_child(ledger, key, record.id.clone());
        }
        self.state.put(record.id.clone(), record);
    }

    fn insert_child(&self, ledger: &mut Ledger, key: ChildKey, child: DocumentId) {
        ledger.track(&key, &child);
        self.children.put(key, child);
        if ledger.tracked > ledger.prune_at {
            ledger.prune(|key| self.children.contains_key(key), self.prune_floor);
        }
    }
}

// ============================================================================
// FACADE
// ============================================================================

enum CacheMode {
    Disabled,
    Shared(Arc<CachePair>),
    PerConnection {
        propagator: Option<InvalidationPropagator>,
    },
}

/// State shared between the facade and its connections.
struct FacadeInner<S: RecordStore> {
    repository: String,
    node_id: String,
    descriptor: CacheDescriptor,
    store: Arc<S>,
    mode: CacheMode,
    cluster: Option<Arc<dyn ClusterInvalidator>>,
    next_connection: AtomicU64,
}

impl<S: RecordStore> FacadeInner<S> {
    /// Evict `id` from every cache reachable from this process.
    fn invalidate_local(&self, message: &InvalidationMessage) {
        match &self.mode {
            CacheMode::Disabled => {}
            CacheMode::Shared(pair) => {
                pair.evict(&message.document_id);
            }
            CacheMode::PerConnection { propagator } => {
                if let Some(propagator) = propagator {
                    propagator.propagate(message.clone());
                }
            }
        }
    }

    fn flush_local(&self) {
        match &self.mode {
            CacheMode::Disabled => {}
            CacheMode::Shared(pair) => pair.clear(),
            CacheMode::PerConnection { propagator } => {
                if let Some(propagator) = propagator {
                    propagator.flush_all();
                }
            }
        }
    }

    /// Hand the message to the cluster without waiting for delivery.
    fn send_to_cluster(&self, message: InvalidationMessage) {
        let Some(cluster) = self.cluster.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = cluster.send(&message).await {
                tracing::warn!(
                    document_id = %message.document_id,
                    error = %e,
                    "Failed to publish cluster invalidation"
                );
            }
        });
    }
}

/// Cache front for a [`RecordStore`].
pub struct CacheFacade<S: RecordStore> {
    inner: Arc<FacadeInner<S>>,
    metrics: Arc<dyn MetricsSink>,
    registered: Vec<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: RecordStore> CacheFacade<S> {
    /// Build the facade described by `descriptor`.
    ///
    /// Fails when clustering and caching are both enabled but the named
    /// cluster invalidator is missing or not registered. Shared caches are
    /// registered with `metrics` and, when configured, swept in the
    /// background; this must run inside a tokio runtime.
    pub async fn new(
        descriptor: &RepositoryDescriptor,
        store: Arc<S>,
        registry: &InvalidatorRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> VellumResult<Self> {
        descriptor.validate()?;
        let cache = &descriptor.cache;
        let cluster_cfg = &descriptor.cluster;

        let cluster = if cluster_cfg.enabled && cache.enabled {
            let name = cluster_cfg
                .invalidator
                .as_deref()
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: "cluster.invalidator".to_string(),
                })?;
            let invalidator = registry.create(name)?;
            invalidator
                .initialize(&cluster_cfg.node_id, &descriptor.name)
                .await?;
            Some(invalidator)
        } else {
            None
        };

        let mut registered = Vec::new();
        let mut tasks = Vec::new();
        let mode = if !cache.enabled {
            CacheMode::Disabled
        } else if store.supports_transactions() {
            CacheMode::PerConnection {
                propagator: cluster
                    .is_some()
                    .then(|| InvalidationPropagator::new(PROPAGATOR_CAPACITY)),
            }
        } else {
            let pair = CachePair::new(&descriptor.name, cache);
            metrics.register_cache(pair.state.name(), pair.state.clone());
            metrics.register_cache(pair.children.name(), pair.children.clone());
            registered.push(pair.state.name().to_string());
            registered.push(pair.children.name().to_string());
            if let Some(period) = cache.sweep_interval() {
                tasks.push(pair.state.spawn_sweeper(period));
                tasks.push(pair.children.spawn_sweeper(period));
            }
            CacheMode::Shared(Arc::new(pair))
        };

        tracing::info!(
            repository = %descriptor.name,
            enabled = cache.enabled,
            per_connection = matches!(mode, CacheMode::PerConnection { .. }),
            clustered = cluster.is_some(),
            "Cache facade ready"
        );

        Ok(Self {
            inner: Arc::new(FacadeInner {
                repository: descriptor.name.clone(),
                node_id: cluster_cfg.node_id.clone(),
                descriptor: cache.clone(),
                store,
                mode,
                cluster,
                next_connection: AtomicU64::new(1),
            }),
            metrics,
            registered,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn repository(&self) -> &str {
        &self.inner.repository
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.inner.mode, CacheMode::Disabled)
    }

    /// Whether all connections share one cache pair.
    pub fn is_shared(&self) -> bool {
        matches!(self.inner.mode, CacheMode::Shared(_))
    }

    pub fn is_clustered(&self) -> bool {
        self.inner.cluster.is_some()
    }

    /// Whether per-connection caches hear about other connections' writes.
    pub fn has_propagator(&self) -> bool {
        matches!(
            self.inner.mode,
            CacheMode::PerConnection {
                propagator: Some(_)
            }
        )
    }

    /// Stats of the shared `(state, children)` caches.
    pub fn shared_stats(&self) -> Option<(CacheStats, CacheStats)> {
        match &self.inner.mode {
            CacheMode::Shared(pair) => Some((pair.state.stats(), pair.children.stats())),
            _ => None,
        }
    }

    /// Open a connection bound to this facade's caches.
    pub fn open_connection(&self) -> CachingConnection<S> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (scope, pending) = match &self.inner.mode {
            CacheMode::Disabled => (ConnectionScope::Uncached, None),
            CacheMode::Shared(pair) => (ConnectionScope::Shared(pair.clone()), None),
            CacheMode::PerConnection { propagator } => {
                let prefix = format!("{}.conn-{id}", self.inner.repository);
                (
                    ConnectionScope::Private(CachePair::new(&prefix, &self.inner.descriptor)),
                    propagator.as_ref().map(|p| Mutex::new(p.subscribe())),
                )
            }
        };
        tracing::debug!(repository = %self.inner.repository, connection = id, "Connection opened");
        CachingConnection {
            id,
            inner: self.inner.clone(),
            scope,
            pending,
        }
    }

    /// Evict `id` from the caches of this process.
    ///
    /// Idempotent. Does not reach other nodes; see [`Self::publish`].
    pub fn invalidate(&self, id: &DocumentId) {
        self.inner
            .invalidate_local(&InvalidationMessage::modified(id.clone(), &self.inner.node_id));
    }

    /// Drop every cached entry in this process.
    pub fn invalidate_all(&self) {
        self.inner.flush_local();
    }

    /// Evict locally and announce the change to the cluster.
    pub fn publish(&self, message: InvalidationMessage) {
        self.inner.invalidate_local(&message);
        self.inner.send_to_cluster(message);
    }

    /// Apply invalidations received from other nodes.
    ///
    /// Returns the number of messages applied. Messages that originated on
    /// this node were already applied when they were sent and are skipped.
    pub async fn process_cluster_invalidations(&self) -> VellumResult<usize> {
        let Some(cluster) = &self.inner.cluster else {
            return Ok(0);
        };
        let batch = cluster.receive().await?;
        if batch.flush {
            tracing::warn!(
                repository = %self.inner.repository,
                "Cluster invalidations were lost, flushing caches"
            );
            self.inner.flush_local();
        }

        let mut applied = 0;
        for message in batch
            .messages
            .iter()
            .filter(|m| m.origin_node_id != self.inner.node_id)
        {
            tracing::debug!(
                document_id = %message.document_id,
                origin = %message.origin_node_id,
                kind = ?message.kind,
                "Applying cluster invalidation"
            );
            self.inner.invalidate_local(message);
            applied += 1;
        }
        Ok(applied)
    }

    /// Poll the cluster invalidator every `poll_interval` until shutdown.
    ///
    /// Returns `false` when clustering is off and nothing was spawned.
    pub fn spawn_cluster_listener(self: &Arc<Self>, poll_interval: std::time::Duration) -> bool {
        if self.inner.cluster.is_none() {
            return false;
        }
        let facade = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let Some(facade) = facade.upgrade() else {
                    break;
                };
                if let Err(e) = facade.process_cluster_invalidations().await {
                    tracing::warn!(error = %e, "Cluster invalidation poll failed");
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        true
    }

    /// Stop background tasks, unregister metrics, clear caches and leave
    /// the cluster. Safe to call more than once.
    pub async fn shutdown(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        for name in &self.registered {
            self.metrics.unregister_cache(name);
        }
        self.inner.flush_local();
        if let Some(cluster) = &self.inner.cluster {
            cluster.close().await;
        }
        tracing::info!(repository = %self.inner.repository, "Cache facade shut down");
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

enum ConnectionScope {
    Uncached,
    Shared(Arc<CachePair>),
    Private(CachePair),
}

impl ConnectionScope {
    fn pair(&self) -> Option<&CachePair> {
        match self {
            Self::Uncached => None,
            Self::Shared(pair) => Some(pair),
            Self::Private(pair) => Some(pair),
        }
    }
}

/// A logical connection to the repository with read-through caching.
///
/// Writes go to the store first, then evict in process and are published
/// to the cluster.
pub struct CachingConnection<S: RecordStore> {
    id: u64,
    inner: Arc<FacadeInner<S>>,
    scope: ConnectionScope,
    pending: Option<Mutex<InvalidationQueue>>,
}

impl<S: RecordStore> CachingConnection<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Apply invalidations published by other connections since the last
    /// operation.
    fn drain_pending(&self) {
        let (Some(pending), Some(pair)) = (&self.pending, self.scope.pair()) else {
            return;
        };
        let batch = match pending.lock() {
            Ok(mut queue) => queue.drain(),
            Err(_) => InvalidationBatch {
                messages: Vec::new(),
                flush: true,
            },
        };
        if !batch.is_empty() {
            pair.apply(&batch);
        }
    }

    /// Fetch a record, from cache when possible.
    pub async fn get(&self, id: &DocumentId) -> VellumResult<Option<Arc<DocumentRecord>>> {
        self.drain_pending();
        let mut seen = None;
        if let Some(pair) = self.scope.pair() {
            if let Some(record) = pair.state.get(id) {
                return Ok(Some(record));
            }
            tracing::debug!(document_id = %id, cache = pair.state.name(), "Cache miss");
            seen = Some(pair.generation());
        }
        let Some(record) = self.inner.store.fetch(id).await? else {
            return Ok(None);
        };
        let record = Arc::new(record);
        if let (Some(pair), Some(seen)) = (self.scope.pair(), seen) {
            if !pair.fill(record.clone(), seen) {
                tracing::debug!(document_id = %id, "Cache fill dropped after concurrent eviction");
            }
        }
        Ok(Some(record))
    }

    /// Cached record without falling back to the store.
    pub fn cached(&self, id: &DocumentId) -> Option<Arc<DocumentRecord>> {
        self.drain_pending();
        self.scope.pair().and_then(|pair| pair.state.get(id))
    }

    /// Resolve a child id by name, from cache when possible.
    pub async fn get_child_id(
        &self,
        parent_id: &DocumentId,
        name: &str,
    ) -> VellumResult<Option<DocumentId>> {
        self.drain_pending();
        let key = ChildKey::new(parent_id.clone(), name);
        let mut seen = None;
        if let Some(pair) = self.scope.pair() {
            if let Some(id) = pair.children.get(&key) {
                return Ok(Some(id));
            }
            seen = Some(pair.generation());
        }
        let found = self.inner.store.find_child(parent_id, name).await?;
        if let (Some(id), Some(pair), Some(seen)) = (&found, self.scope.pair(), seen) {
            pair.fill_child(key, id.clone(), seen);
        }
        Ok(found)
    }

    /// Cache a record fetched elsewhere.
    pub fn put(&self, record: Arc<DocumentRecord>) {
        self.drain_pending();
        if let Some(pair) = self.scope.pair() {
            pair.remember(record);
        }
    }

    /// Evict `id` from the caches this connection reads.
    pub fn invalidate(&self, id: &DocumentId) {
        self.drain_pending();
        if let Some(pair) = self.scope.pair() {
            pair.evict(id);
        }
    }

    pub fn invalidate_all(&self) {
        if let Some(pair) = self.scope.pair() {
            pair.clear();
        }
        // Anything queued is covered by the clear
        if let Some(pending) = &self.pending {
            if let Ok(mut queue) = pending.lock() {
                queue.drain();
            }
        }
    }

    /// Write a record and invalidate every cache holding it.
    pub async fn save(&self, record: &DocumentRecord) -> VellumResult<()> {
        self.drain_pending();
        self.inner.store.save(record).await?;
        let message = InvalidationMessage::modified(record.id.clone(), &self.inner.node_id);
        self.announce(message);
        Ok(())
    }

    /// Delete a record and its subtree, invalidating every removed id.
    pub async fn delete(&self, id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
        self.drain_pending();
        let removed = self.inner.store.delete(id).await?;
        for gone in &removed {
            let message = InvalidationMessage::deleted(gone.clone(), &self.inner.node_id);
            self.announce(message);
        }
        Ok(removed)
    }

    fn announce(&self, message: InvalidationMessage) {
        if let ConnectionScope::Private(pair) = &self.scope {
            pair.evict(&message.document_id);
        }
        self.inner.invalidate_local(&message);
        self.inner.send_to_cluster(message);
    }

    /// Close the connection, discarding private caches.
    pub fn close(self) {
        tracing::debug!(repository = %self.inner.repository, connection = self.id, "Connection closed");
    }

    /// Fetch a record that must exist.
    pub async fn require(&self, id: &DocumentId) -> VellumResult<Arc<DocumentRecord>> {
        self.get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound { id: id.clone() }.into())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BroadcastClusterInvalidator, ClusterBus, NoopMetricsSink, PrometheusMetricsSink};
    use crate::InMemoryRecordStore;
    use std::time::Duration;
    use vellum_core::{ConfigError, VellumError};

    fn seeded(store: InMemoryRecordStore) -> (Arc<InMemoryRecordStore>, DocumentRecord, DocumentRecord) {
        let root = DocumentRecord::root(DocumentId::from("root"));
        let doc = DocumentRecord::child_of(&root, "doc", "File");
        store.insert(root.clone()).unwrap();
        store.insert(doc.clone()).unwrap();
        (Arc::new(store), root, doc)
    }

    fn descriptor() -> RepositoryDescriptor {
        let mut descriptor = RepositoryDescriptor::new("repo");
        descriptor.cache.sweep_interval_secs = 0;
        descriptor
    }

    fn clustered(node: &str) -> RepositoryDescriptor {
        let mut descriptor = descriptor();
        descriptor.cluster.enabled = true;
        descriptor.cluster.node_id = node.to_string();
        descriptor.cluster.invalidator = Some("broadcast".to_string());
        descriptor
    }

    async fn facade(
        descriptor: &RepositoryDescriptor,
        store: Arc<InMemoryRecordStore>,
    ) -> CacheFacade<InMemoryRecordStore> {
        CacheFacade::new(
            descriptor,
            store,
            &InvalidatorRegistry::new(),
            Arc::new(NoopMetricsSink),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_through_hits_cache() {
        let (store, _root, doc) = seeded(InMemoryRecordStore::new());
        let facade = facade(&descriptor(), store.clone()).await;
        let conn = facade.open_connection();

        assert_eq!(conn.get(&doc.id).await.unwrap().unwrap().name, "doc");
        assert_eq!(conn.get(&doc.id).await.unwrap().unwrap().name, "doc");
        assert_eq!(store.fetch_calls(), 1);

        let (state, _) = facade.shared_stats().unwrap();
        assert_eq!(state.hits, 1);
        assert_eq!(state.misses, 1);
    }

    #[tokio::test]
    async fn test_shared_cache_visible_across_connections() {
        let (store, _root, doc) = seeded(InMemoryRecordStore::new());
        let facade = facade(&descriptor(), store.clone()).await;
        let a = facade.open_connection();
        let b = facade.open_connection();

        a.get(&doc.id).await.unwrap();
        assert!(b.cached(&doc.id).is_some());
        assert!(facade.is_shared());
    }

    #[tokio::test]
    async fn test_transactional_store_gets_private_caches() {
        let (store, _root, doc) = seeded(InMemoryRecordStore::transactional());
        let facade = facade(&descriptor(), store.clone()).await;
        let a = facade.open_connection();
        let b = facade.open_connection();

        a.get(&doc.id).await.unwrap();
        assert!(a.cached(&doc.id).is_some());
        assert!(b.cached(&doc.id).is_none());
        assert!(!facade.is_shared());
        assert!(!facade.has_propagator());
    }

    #[tokio::test]
    async fn test_disabled_cache_always_fetches() {
        let (store, _root, doc) = seeded(InMemoryRecordStore::new());
        let mut descriptor = descriptor();
        descriptor.cache.enabled = false;
        let facade = facade(&descriptor, store.clone()).await;
        let conn = facade.open_connection();

        conn.get(&doc.id).await.unwrap();
        conn.get(&doc.id).await.unwrap();
        assert_eq!(store.fetch_calls(), 2);
        assert!(!facade.is_enabled());
    }

    #[tokio::test]
    async fn test_child_lookup_is_cached_and_evicted_on_rename() {
        let (store, root, doc) = seeded(InMemoryRecordStore::new());
        let facade = facade(&descriptor(), store.clone()).await;
        let conn = facade.open_connection();

        assert_eq!(conn.get_child_id(&root.id, "doc").await.unwrap(), Some(doc.id.clone()));
        // Served from cache even after a detached removal
        store.remove_detached(&doc.id).unwrap();
        assert_eq!(conn.get_child_id(&root.id, "doc").await.unwrap(), Some(doc.id.clone()));

        let mut renamed = doc.clone();
        renamed.name = "renamed".to_string();
        conn.save(&renamed).await.unwrap();
        assert_eq!(conn.get_child_id(&root.id, "doc").await.unwrap(), None);
        assert_eq!(conn.get_child_id(&root.id, "renamed").await.unwrap(), Some(doc.id));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let (store, root, doc) = seeded(InMemoryRecordStore::new());
        let facade = facade(&descriptor(), store.clone()).await;
        let conn = facade.open_connection();
        conn.get(&root.id).await.unwrap();
        conn.get(&doc.id).await.unwrap();

        facade.invalidate(&doc.id);
        let once = facade.shared_stats().unwrap();
        facade.invalidate(&doc.id);
        let twice = facade.shared_stats().unwrap();

        assert_eq!(once.0.entry_count, twice.0.entry_count);
        assert_eq!(once.1.entry_count, twice.1.entry_count);
        assert!(conn.cached(&doc.id).is_none());
        assert!(conn.cached(&root.id).is_some());
    }

    #[tokio::test]
    async fn test_delete_evicts_subtree() {
        let (store, root, doc) = seeded(InMemoryRecordStore::new());
        let facade = facade(&descriptor(), store.clone()).await;
        let conn = facade.open_connection();
        conn.get(&doc.id).await.unwrap();

        let removed = conn.delete(&root.id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(conn.cached(&doc.id).is_none());
        assert!(conn.get(&doc.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let (store, _root, doc) = seeded(InMemoryRecordStore::new());
        let facade = facade(&descriptor(), store.clone()).await;
        let conn = facade.open_connection();
        conn.get(&doc.id).await.unwrap();

        tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;
        assert!(conn.cached(&doc.id).is_none());
        conn.get(&doc.id).await.unwrap();
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_cluster_without_invalidator_fails() {
        let (store, _root, _doc) = seeded(InMemoryRecordStore::new());
        let mut descriptor = clustered("n1");
        descriptor.cluster.invalidator = None;

        let err = CacheFacade::new(
            &descriptor,
            store.clone(),
            &InvalidatorRegistry::new(),
            Arc::new(NoopMetricsSink),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(
            err,
            VellumError::Config(ConfigError::MissingRequired {
                field: "cluster.invalidator".to_string()
            })
        );

        let err = CacheFacade::new(
            &clustered("n1"),
            store,
            &InvalidatorRegistry::new(),
            Arc::new(NoopMetricsSink),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(
            err,
            VellumError::Config(ConfigError::UnknownInvalidator {
                name: "broadcast".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_cluster_disabled_cache_needs_no_invalidator() {
        let (store, _root, _doc) = seeded(InMemoryRecordStore::new());
        let mut descriptor = clustered("n1");
        descriptor.cache.enabled = false;
        descriptor.cluster.invalidator = None;
        let facade = facade(&descriptor, store).await;
        assert!(!facade.is_clustered());
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_write_on_one_node_evicts_on_the_other() {
        let bus = ClusterBus::default();
        let registry = InvalidatorRegistry::with_broadcast(bus.clone());
        let (store, _root, doc) = seeded(InMemoryRecordStore::new());

        let n1 = CacheFacade::new(&clustered("n1"), store.clone(), &registry, Arc::new(NoopMetricsSink))
            .await
            .unwrap();
        let n2 = CacheFacade::new(&clustered("n2"), store.clone(), &registry, Arc::new(NoopMetricsSink))
            .await
            .unwrap();
        let c1 = n1.open_connection();
        let c2 = n2.open_connection();
        c2.get(&doc.id).await.unwrap();

        c1.save(&doc.clone().with_state(serde_json::json!({"v": 2})))
            .await
            .unwrap();
        settle().await;

        assert!(c2.cached(&doc.id).is_some());
        assert_eq!(n2.process_cluster_invalidations().await.unwrap(), 1);
        assert!(c2.cached(&doc.id).is_none());
        // Own messages are skipped
        assert_eq!(n1.process_cluster_invalidations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_propagator_reaches_other_local_connections() {
        let bus = ClusterBus::default();
        let registry = InvalidatorRegistry::with_broadcast(bus);
        let (store, _root, doc) = seeded(InMemoryRecordStore::transactional());
        let facade = CacheFacade::new(&clustered("n1"), store, &registry, Arc::new(NoopMetricsSink))
            .await
            .unwrap();
        assert!(facade.has_propagator());

        let a = facade.open_connection();
        let b = facade.open_connection();
        b.get(&doc.id).await.unwrap();
        a.save(&doc).await.unwrap();

        assert!(b.cached(&doc.id).is_none());
    }

    #[tokio::test]
    async fn test_cluster_message_reaches_private_caches() {
        let bus = ClusterBus::default();
        let registry = InvalidatorRegistry::with_broadcast(bus.clone());
        let (store, _root, doc) = seeded(InMemoryRecordStore::transactional());
        let facade = CacheFacade::new(&clustered("n1"), store, &registry, Arc::new(NoopMetricsSink))
            .await
            .unwrap();
        let conn = facade.open_connection();
        conn.get(&doc.id).await.unwrap();

        let remote = BroadcastClusterInvalidator::new(bus);
        remote.initialize("n2", "repo").await.unwrap();
        remote
            .send(&InvalidationMessage::modified(doc.id.clone(), "n2"))
            .await
            .unwrap();

        assert_eq!(facade.process_cluster_invalidations().await.unwrap(), 1);
        assert!(conn.cached(&doc.id).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_unregisters_metrics() {
        let (store, _root, doc) = seeded(InMemoryRecordStore::new());
        let sink = Arc::new(PrometheusMetricsSink::new(prometheus::Registry::new()));
        let facade = CacheFacade::new(&descriptor(), store.clone(), &InvalidatorRegistry::new(), sink.clone())
            .await
            .unwrap();
        let mut names = sink.registered();
        names.sort();
        assert_eq!(names, vec!["repo.children".to_string(), "repo.state".to_string()]);

        let conn = facade.open_connection();
        conn.get(&doc.id).await.unwrap();
        facade.shutdown().await;
        assert!(sink.registered().is_empty());
        assert!(conn.cached(&doc.id).is_none());

        // Same registry accepts a fresh facade
        let again = CacheFacade::new(&descriptor(), store, &InvalidatorRegistry::new(), sink.clone())
            .await
            .unwrap();
        assert_eq!(sink.registered().len(), 2);
        again.shutdown().await;
    }

    /// Reads the tree when called but answers `fetch` only after `delay`.
    struct LateReply {
        inner: InMemoryRecordStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RecordStore for LateReply {
        fn supports_transactions(&self) -> bool {
            self.inner.supports_transactions()
        }

        async fn fetch(&self, id: &DocumentId) -> VellumResult<Option<DocumentRecord>> {
            let read = self.inner.fetch(id).await;
            tokio::time::sleep(self.delay).await;
            read
        }

        async fn fetch_many(&self, ids: &[DocumentId]) -> VellumResult<Vec<DocumentRecord>> {
            self.inner.fetch_many(ids).await
        }

        async fn query_descendant_ids(&self, container_id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
            self.inner.query_descendant_ids(container_id).await
        }

        async fn child_ids(&self, parent_id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
            self.inner.child_ids(parent_id).await
        }

        async fn find_child(&self, parent_id: &DocumentId, name: &str) -> VellumResult<Option<DocumentId>> {
            self.inner.find_child(parent_id, name).await
        }

        async fn save(&self, record: &DocumentRecord) -> VellumResult<()> {
            self.inner.save(record).await
        }

        async fn delete(&self, id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_during_slow_read_leaves_no_stale_entry() {
        let inner = InMemoryRecordStore::new();
        let root = DocumentRecord::root(DocumentId::from("root"));
        let doc = DocumentRecord::child_of(&root, "doc", "File");
        inner.insert(root).unwrap();
        inner.insert(doc.clone()).unwrap();
        let store = Arc::new(LateReply {
            inner,
            delay: Duration::from_millis(100),
        });
        let facade = Arc::new(
            CacheFacade::new(&descriptor(), store, &InvalidatorRegistry::new(), Arc::new(NoopMetricsSink))
                .await
                .unwrap(),
        );

        let reader = {
            let facade = facade.clone();
            let id = doc.id.clone();
            tokio::spawn(async move { facade.open_connection().get(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let writer = facade.open_connection();
        writer
            .save(&doc.clone().with_state(serde_json::json!({"v": 2})))
            .await
            .unwrap();

        let early = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(early.state, serde_json::Value::Null);

        tokio::time::advance(Duration::from_secs(60)).await;
        let conn = facade.open_connection();
        assert!(conn.cached(&doc.id).is_none());
        assert_eq!(conn.get(&doc.id).await.unwrap().unwrap().state["v"], 2);
        assert_eq!(conn.cached(&doc.id).unwrap().state["v"], 2);
    }

    #[test]
    fn test_eviction_uses_child_index() {
        let descriptor = CacheDescriptor {
            max_size: 16,
            ..CacheDescriptor::default()
        };
        let pair = CachePair::new("t", &descriptor);
        let root = DocumentRecord::root(DocumentId::from("root"));
        let folder = DocumentRecord::child_of(&root, "folder", "Folder");
        let file = DocumentRecord::child_of(&folder, "file", "File");
        let other = DocumentRecord::child_of(&root, "other", "File");
        pair.remember(Arc::new(folder.clone()));
        pair.remember(Arc::new(file.clone()));
        pair.remember(Arc::new(other.clone()));
        assert_eq!(pair.children.len(), 3);

        // The name entry resolving to the folder and the one keyed under it
        assert_eq!(pair.evict(&folder.id), 3);
        assert_eq!(pair.children.len(), 1);
        assert!(pair.children.contains_key(&ChildKey::new(root.id.clone(), "other")));
        assert!(pair.state.contains_key(&file.id));
        assert_eq!(pair.evict(&folder.id), 0);
    }

    #[test]
    fn test_child_index_stays_bounded() {
        let descriptor = CacheDescriptor {
            max_size: 16,
            ..CacheDescriptor::default()
        };
        let pair = CachePair::new("t", &descriptor);
        let root = DocumentRecord::root(DocumentId::from("root"));
        for i in 0..2_000 {
            pair.remember(Arc::new(DocumentRecord::child_of(&root, format!("f{i}"), "File")));
            assert!(pair.ledger().tracked <= pair.prune_floor + 2);
        }
        assert!(pair.children.len() <= 16);
    }

    #[test]
    fn test_fill_after_eviction_is_dropped() {
        let pair = CachePair::new("t", &CacheDescriptor::default());
        let root = DocumentRecord::root(DocumentId::from("root"));
        let doc = Arc::new(DocumentRecord::child_of(&root, "doc", "File"));

        let seen = pair.generation();
        pair.evict(&doc.id);
        assert!(!pair.fill(doc.clone(), seen));
        assert!(!pair.fill_child(ChildKey::new(root.id.clone(), "doc"), doc.id.clone(), seen));
        assert!(pair.state.is_empty());
        assert!(pair.children.is_empty());

        assert!(pair.fill(doc.clone(), pair.generation()));
        assert!(pair.state.contains_key(&doc.id));
    }
}
