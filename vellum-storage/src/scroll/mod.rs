//! Resumable descendant enumeration.
//!
//! A scroll walks every listable descendant of a container in pages:
//!
//! 1. [`SearchContextCache`] snapshots the descendant ids once per scroll
//!    and hands out the next slice for each call.
//! 2. [`ChunkedFetcher`] loads the records of that slice in bounded chunks.
//! 3. [`AncestorResolver`] adapts each record under its parent node, using
//!    the [`NodeAdapterRegistry`] to pick the node shape.
//! 4. [`ScrollCoordinator`] runs the above under a process-wide permit pool
//!    and returns a [`ScrollPage`].
//!
//! Scrolls bypass the point-lookup cache.

pub mod adapter;
pub mod ancestors;
pub mod coordinator;
pub mod fetcher;
pub mod search_context;

pub use adapter::{NodeAdapterRegistry, NodeConstructor};
pub use ancestors::{AdaptedBatch, AncestorResolver};
pub use coordinator::{ScrollCoordinator, ScrollPage, ScrollPhase, SKIPPED_BATCHES_PER_PERMIT};
pub use fetcher::ChunkedFetcher;
pub use search_context::{PendingBatch, SearchContextCache};
