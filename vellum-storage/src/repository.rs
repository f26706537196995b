//! Repository entry point.
//!
//! A [`Repository`] ties one [`RecordStore`] to its cache facade and scroll
//! coordinator. Callers work through [`Session`]s, each bound to one cache
//! connection and one principal.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use vellum_core::{
    DocumentId, DocumentRecord, Principal, RepositoryDescriptor, ScrollToken, StorageError,
    VellumResult,
};

use crate::cache::{CacheFacade, CachingConnection, InvalidatorRegistry, MetricsSink, NoopMetricsSink};
use crate::scroll::{NodeAdapterRegistry, ScrollCoordinator, ScrollPage};
use crate::RecordStore;

/// Collaborators injected when a repository is opened.
pub struct RepositoryServices {
    pub invalidators: InvalidatorRegistry,
    pub metrics: Arc<dyn MetricsSink>,
    pub adapters: NodeAdapterRegistry,
    /// Permit pool shared with other repositories; a private one sized by
    /// `scroll.max_concurrent_scrolls` is created when absent.
    pub scroll_permits: Option<Arc<Semaphore>>,
}

impl Default for RepositoryServices {
    fn default() -> Self {
        Self {
            invalidators: InvalidatorRegistry::new(),
            metrics: Arc::new(NoopMetricsSink),
            adapters: NodeAdapterRegistry::standard(),
            scroll_permits: None,
        }
    }
}

/// An opened repository.
pub struct Repository<S: RecordStore> {
    descriptor: RepositoryDescriptor,
    facade: Arc<CacheFacade<S>>,
    scroller: Arc<ScrollCoordinator<S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: RecordStore> Repository<S> {
    /// Open with the standard node adapters.
    pub async fn open(
        descriptor: RepositoryDescriptor,
        store: Arc<S>,
        registry: &InvalidatorRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> VellumResult<Self> {
        let services = RepositoryServices {
            invalidators: registry.clone(),
            metrics,
            ..RepositoryServices::default()
        };
        Self::open_with(descriptor, store, services).await
    }

    /// Open the repository described by `descriptor`.
    ///
    /// Must run inside a tokio runtime: the cluster listener and expiry
    /// sweepers are spawned here.
    pub async fn open_with(
        descriptor: RepositoryDescriptor,
        store: Arc<S>,
        services: RepositoryServices,
    ) -> VellumResult<Self> {
        descriptor.validate()?;

        let facade = Arc::new(
            CacheFacade::new(
                &descriptor,
                store.clone(),
                &services.invalidators,
                services.metrics,
            )
            .await?,
        );
        facade.spawn_cluster_listener(descriptor.cluster.poll_interval());

        let mut scroller = ScrollCoordinator::new(store, &descriptor.scroll, services.adapters);
        if let Some(permits) = services.scroll_permits {
            scroller = scroller.with_permits(permits);
        }

        let mut tasks = Vec::new();
        if let Some(period) = descriptor.cache.sweep_interval() {
            tasks.push(scroller.contexts().spawn_sweeper(period));
        }

        tracing::info!(repository = %descriptor.name, "Repository opened");
        Ok(Self {
            descriptor,
            facade,
            scroller: Arc::new(scroller),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    pub fn facade(&self) -> &Arc<CacheFacade<S>> {
        &self.facade
    }

    pub fn scroller(&self) -> &Arc<ScrollCoordinator<S>> {
        &self.scroller
    }

    /// Open a session acting as `principal`.
    pub fn session(&self, principal: Principal) -> Session<S> {
        Session {
            principal,
            connection: self.facade.open_connection(),
            scroller: self.scroller.clone(),
        }
    }

    /// Stop background work, interrupt waiting scrolls, drop every cache
    /// and search context, and leave the cluster.
    pub async fn shutdown(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        self.scroller.close();
        self.scroller.contexts().clear();
        self.facade.shutdown().await;
        tracing::info!(repository = %self.descriptor.name, "Repository shut down");
    }
}

/// A principal's connection to a repository.
pub struct Session<S: RecordStore> {
    principal: Principal,
    connection: CachingConnection<S>,
    scroller: Arc<ScrollCoordinator<S>>,
}

impl<S: RecordStore> Session<S> {
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn connection(&self) -> &CachingConnection<S> {
        &self.connection
    }

    fn check_readable(&self, record: &DocumentRecord) -> VellumResult<()> {
        if record.acl.permits(&self.principal) {
            Ok(())
        } else {
            Err(StorageError::AccessDenied {
                id: record.id.clone(),
                principal: self.principal.name.clone(),
            }
            .into())
        }
    }

    /// Read a document through the cache.
    pub async fn get_document(&self, id: &DocumentId) -> VellumResult<Arc<DocumentRecord>> {
        let record = self.connection.require(id).await?;
        self.check_readable(&record)?;
        Ok(record)
    }

    /// Resolve a child of `parent_id` by name.
    pub async fn get_child(
        &self,
        parent_id: &DocumentId,
        name: &str,
    ) -> VellumResult<Option<Arc<DocumentRecord>>> {
        let Some(child_id) = self.connection.get_child_id(parent_id, name).await? else {
            return Ok(None);
        };
        let Some(record) = self.connection.get(&child_id).await? else {
            return Ok(None);
        };
        self.check_readable(&record)?;
        Ok(Some(record))
    }

    /// Listable children of `parent_id` the principal may read.
    pub async fn get_children(&self, parent_id: &DocumentId) -> VellumResult<Vec<Arc<DocumentRecord>>> {
        self.get_document(parent_id).await?;
        let ids = self.connection.store().child_ids(parent_id).await?;
        let mut children = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.connection.get(&id).await? {
                if record.is_listable() && record.acl.permits(&self.principal) {
                    children.push(record);
                }
            }
        }
        Ok(children)
    }

    pub async fn save(&self, record: &DocumentRecord) -> VellumResult<()> {
        self.connection.save(record).await
    }

    /// Delete a document and its subtree. Returns every removed id.
    pub async fn delete(&self, id: &DocumentId) -> VellumResult<Vec<DocumentId>> {
        self.connection.delete(id).await
    }

    /// Next page of the descendants of `container_id`.
    pub async fn scroll_descendants(
        &self,
        container_id: &DocumentId,
        token: &ScrollToken,
        batch_size: usize,
        keep_alive: Duration,
    ) -> VellumResult<ScrollPage> {
        self.scroller
            .scroll(&self.principal, container_id, token, batch_size, keep_alive)
            .await
    }

    pub fn close(self) {
        self.connection.close();
    }
}
