//! Vellum Core - Repository Types
//!
//! Pure data structures shared by the storage, cache and scroll layers:
//! document records, adapted nodes, invalidation messages, the error taxonomy
//! and the repository descriptor. This crate performs no I/O beyond reading a
//! descriptor file.

pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod invalidation;
pub mod node;

pub use config::{
    CacheDescriptor, ClusterDescriptor, RepositoryDescriptor, ScrollDescriptor,
    DEFAULT_FETCH_CHUNK_SIZE, DEFAULT_MAX_DESCENDANTS_BATCH_SIZE,
};
pub use document::{join_path, AclSnapshot, DocumentFlags, DocumentRecord, Principal};
pub use error::{
    ClusterError, ConfigError, ScrollError, StorageError, VellumError, VellumResult,
};
pub use identity::{DocumentId, ScrollToken, Timestamp};
pub use invalidation::{InvalidationKind, InvalidationMessage};
pub use node::{Node, NodeKind};
