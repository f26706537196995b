//! Point-lookup caching with cluster-aware invalidation.
//!
//! [`CacheFacade`] sits in front of a [`crate::RecordStore`] and caches two
//! lookups per repository: `id -> record` and `(parent, name) -> child id`.
//! Both are [`TtlCache`]s bounded by entry count and absolute time-to-live.
//!
//! # Invalidation
//!
//! Invalidation is an idempotent eviction, never an ordered log. Messages
//! may arrive more than once and in any order across documents:
//!
//! - shared caches (non-transactional store) are evicted in place by the
//!   writer;
//! - per-connection caches (transactional store) drain an
//!   [`InvalidationPropagator`] subscription before each operation;
//! - other nodes are reached through a [`ClusterInvalidator`] picked by name
//!   from an [`InvalidatorRegistry`].
//!
//! # Example
//!
//! ```ignore
//! let facade = CacheFacade::new(&descriptor, store, &registry, metrics).await?;
//! let conn = facade.open_connection();
//! let record = conn.get(&id).await?;
//! conn.save(&updated).await?; // evicts here, publishes to the cluster
//! ```

pub mod cluster;
pub mod facade;
pub mod metrics;
pub mod propagator;
pub mod traits;
pub mod ttl;

pub use cluster::{
    BroadcastClusterInvalidator, ClusterBus, ClusterInvalidator, InvalidatorFactory,
    InvalidatorRegistry, BROADCAST_INVALIDATOR,
};
pub use facade::{CacheFacade, CachingConnection, ChildKey};
pub use metrics::{MetricsSink, NoopMetricsSink, PrometheusMetricsSink};
pub use propagator::{InvalidationBatch, InvalidationPropagator, InvalidationQueue};
pub use traits::{Cache, CacheStats, StatsSource};
pub use ttl::TtlCache;
