//! Cross-node invalidation transport.
//!
//! A [`ClusterInvalidator`] carries [`InvalidationMessage`]s between nodes of
//! one repository. Implementations are chosen by name through an
//! [`InvalidatorRegistry`] when the repository is opened.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use vellum_core::{ClusterError, ConfigError, InvalidationMessage, VellumResult};

use super::propagator::InvalidationBatch;

/// Registry name of [`BroadcastClusterInvalidator`].
pub const BROADCAST_INVALIDATOR: &str = "broadcast";

/// Transport for cache invalidations between cluster nodes.
///
/// Delivery is at least once and unordered across documents. Receivers may
/// see their own messages; filtering by origin is the caller's job.
#[async_trait]
pub trait ClusterInvalidator: Send + Sync {
    /// Join the cluster as `node_id` for `repository`.
    async fn initialize(&self, node_id: &str, repository: &str) -> VellumResult<()>;

    /// Publish one invalidation to every node.
    async fn send(&self, message: &InvalidationMessage) -> VellumResult<()>;

    /// Collect whatever arrived since the previous call. Never waits.
    async fn receive(&self) -> VellumResult<InvalidationBatch>;

    /// Leave the cluster. Further sends fail with `NotInitialized`.
    async fn close(&self);
}

// ============================================================================
// IN-PROCESS BUS
// ============================================================================

#[derive(Debug, Clone)]
struct Envelope {
    repository: Arc<str>,
    payload: Arc<[u8]>,
}

/// Shared medium standing in for the network between nodes.
///
/// Every invalidator created from the same bus sees every message published
/// on it. Payloads travel in wire encoding.
#[derive(Debug, Clone)]
pub struct ClusterBus {
    tx: broadcast::Sender<Envelope>,
}

impl ClusterBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of nodes currently attached.
    pub fn node_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ClusterBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct Membership {
    node_id: String,
    repository: Arc<str>,
    rx: broadcast::Receiver<Envelope>,
}

/// [`ClusterInvalidator`] over a [`ClusterBus`].
pub struct BroadcastClusterInvalidator {
    bus: ClusterBus,
    membership: Mutex<Option<Membership>>,
}

impl BroadcastClusterInvalidator {
    pub fn new(bus: ClusterBus) -> Self {
        Self {
            bus,
            membership: Mutex::new(None),
        }
    }

    /// Node id given to `initialize`, if joined.
    pub fn node_id(&self) -> Option<String> {
        self.membership
            .lock()
            .ok()
            .and_then(|m| m.as_ref().map(|m| m.node_id.clone()))
    }

    fn repository(&self) -> VellumResult<Arc<str>> {
        let guard = self
            .membership
            .lock()
            .map_err(|_| ClusterError::ChannelClosed)?;
        guard
            .as_ref()
            .map(|m| m.repository.clone())
            .ok_or_else(|| ClusterError::NotInitialized.into())
    }
}

impl fmt::Debug for BroadcastClusterInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastClusterInvalidator")
            .field("node_id", &self.node_id())
            .finish()
    }
}

#[async_trait]
impl ClusterInvalidator for BroadcastClusterInvalidator {
    async fn initialize(&self, node_id: &str, repository: &str) -> VellumResult<()> {
        let mut guard = self
            .membership
            .lock()
            .map_err(|_| ClusterError::ChannelClosed)?;
        *guard = Some(Membership {
            node_id: node_id.to_string(),
            repository: Arc::from(repository),
            rx: self.bus.tx.subscribe(),
        });
        tracing::info!(node_id, repository, "Cluster invalidator joined");
        Ok(())
    }

    async fn send(&self, message: &InvalidationMessage) -> VellumResult<()> {
        let repository = self.repository()?;
        let payload = message.to_wire().map_err(|e| ClusterError::SendFailed {
            document_id: message.document_id.clone(),
            reason: e.to_string(),
        })?;
        let envelope = Envelope {
            repository,
            payload: Arc::from(payload),
        };
        // Our own subscription keeps the channel open while joined.
        self.bus
            .tx
            .send(envelope)
            .map_err(|_| ClusterError::ChannelClosed)?;
        Ok(())
    }

    async fn receive(&self) -> VellumResult<InvalidationBatch> {
        let mut guard = self
            .membership
            .lock()
            .map_err(|_| ClusterError::ChannelClosed)?;
        let membership = guard.as_mut().ok_or(ClusterError::NotInitialized)?;

        let mut batch = InvalidationBatch::default();
        loop {
            match membership.rx.try_recv() {
                Ok(envelope) => {
                    if envelope.repository != membership.repository {
                        continue;
                    }
                    match InvalidationMessage::from_wire(&envelope.payload) {
                        Ok(message) => batch.messages.push(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping undecodable invalidation");
                        }
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        node_id = %membership.node_id,
                        skipped,
                        "Cluster invalidations lost"
                    );
                    batch.flush = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => return Err(ClusterError::ChannelClosed.into()),
            }
        }
        Ok(batch)
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.membership.lock() {
            if let Some(membership) = guard.take() {
                tracing::info!(node_id = %membership.node_id, "Cluster invalidator left");
            }
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Builds a fresh invalidator instance.
pub type InvalidatorFactory = Arc<dyn Fn() -> Arc<dyn ClusterInvalidator> + Send + Sync>;

/// Named invalidator implementations, fixed at configuration time.
#[derive(Clone, Default)]
pub struct InvalidatorRegistry {
    factories: HashMap<String, InvalidatorFactory>,
}

impl InvalidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`BroadcastClusterInvalidator`] under `"broadcast"`.
    pub fn with_broadcast(bus: ClusterBus) -> Self {
        let mut registry = Self::new();
        registry.register(BROADCAST_INVALIDATOR, move || {
            Arc::new(BroadcastClusterInvalidator::new(bus.clone())) as Arc<dyn ClusterInvalidator>
        });
        registry
    }

    /// Register or replace the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ClusterInvalidator> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn ClusterInvalidator>, ConfigError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownInvalidator {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for InvalidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}
