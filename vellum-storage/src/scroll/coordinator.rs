//! End-to-end descendant scroll call.
//!
//! ```text
//! IDLE -> PERMIT_ACQUIRED -> (QUERYING | EXTRACTING) -> FETCHING -> ADAPTING -> DONE
//!   \____________________________________________________________________-> FAILED
//! ```
//!
//! Every call holds one permit of a semaphore shared by all scrolls of the
//! process, released on every exit path. Batch size is checked before the
//! permit is requested, so a rejected call does no backend work.
//!
//! An empty page ends the scroll, so a call keeps consuming batches until
//! one yields an item. After [`SKIPPED_BATCHES_PER_PERMIT`] batches in a row
//! with nothing visible, the call hands its permit back and queues for a new
//! one, so a large invisible subtree cannot starve other scrolls. Consumed
//! batches stay committed; a call that fails while re-queueing can be resumed
//! with the same token.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::Instrument;
use vellum_core::{
    DocumentId, Node, NodeKind, Principal, ScrollDescriptor, ScrollError, ScrollToken,
    StorageError, VellumResult,
};

use super::adapter::NodeAdapterRegistry;
use super::ancestors::AncestorResolver;
use super::fetcher::ChunkedFetcher;
use super::search_context::SearchContextCache;
use crate::RecordStore;

/// Consecutive fully skipped batches one permit hold may consume.
pub const SKIPPED_BATCHES_PER_PERMIT: usize = 8;

/// Stage of a scroll call, reported in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrollPhase {
    Idle,
    PermitAcquired,
    /// Running the descendant query for a new scroll.
    Querying,
    /// Taking the next ids from an existing search context.
    Extracting,
    Fetching,
    Adapting,
    Done,
    Failed,
}

impl ScrollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PermitAcquired => "permit_acquired",
            Self::Querying => "querying",
            Self::Extracting => "extracting",
            Self::Fetching => "fetching",
            Self::Adapting => "adapting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for ScrollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traces phase transitions; a call dropped before `Done` ends as `Failed`.
struct PhaseLog {
    phase: ScrollPhase,
}

impl PhaseLog {
    fn new() -> Self {
        Self {
            phase: ScrollPhase::Idle,
        }
    }

    fn enter(&mut self, next: ScrollPhase) {
        tracing::trace!(from = %self.phase, to = %next, "Scroll phase");
        self.phase = next;
    }
}

impl Drop for PhaseLog {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            tracing::debug!(at = %self.phase, "Scroll call failed");
            self.phase = ScrollPhase::Failed;
        }
    }
}

/// One page of a descendant scroll.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPage {
    pub items: Vec<Node>,
    pub scroll_token: ScrollToken,
    /// Ids consumed by this call that produced no item.
    pub skipped: usize,
}

impl ScrollPage {
    /// An empty page ends the scroll.
    pub fn is_end(&self) -> bool {
        self.items.is_empty()
    }
}

/// Drives scroll calls over a [`RecordStore`].
pub struct ScrollCoordinator<S: RecordStore> {
    store: Arc<S>,
    contexts: SearchContextCache<S>,
    fetcher: ChunkedFetcher<S>,
    resolver: AncestorResolver<S>,
    permits: Arc<Semaphore>,
    max_batch_size: usize,
    permit_timeout: Option<Duration>,
}

impl<S: RecordStore> ScrollCoordinator<S> {
    pub fn new(store: Arc<S>, descriptor: &ScrollDescriptor, adapters: NodeAdapterRegistry) -> Self {
        Self {
            contexts: SearchContextCache::new(
                store.clone(),
                descriptor.search_context_ttl(),
                descriptor.search_context_max_entries,
            ),
            fetcher: ChunkedFetcher::new(store.clone(), descriptor.fetch_chunk_size),
            resolver: AncestorResolver::new(store.clone(), Arc::new(adapters)),
            store,
            permits: Arc::new(Semaphore::new(descriptor.max_concurrent_scrolls)),
            max_batch_size: descriptor.max_descendants_batch_size,
            permit_timeout: descriptor.permit_timeout(),
        }
    }

    /// Use a permit pool shared with other coordinators.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = permits;
        self
    }

    pub fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn contexts(&self) -> &SearchContextCache<S> {
        &self.contexts
    }

    /// Close the permit pool. Waiting and future calls fail with
    /// [`ScrollError::Interrupted`].
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Return the next page of descendants of `container_id`.
    ///
    /// Pass an empty token to start; pass the returned token to continue.
    /// An empty page means the scroll is exhausted and its context is
    /// dropped. `keep_alive` bounds how long an idle context survives; zero
    /// selects the configured default.
    pub async fn scroll(
        &self,
        principal: &Principal,
        container_id: &DocumentId,
        token: &ScrollToken,
        batch_size: usize,
        keep_alive: Duration,
    ) -> VellumResult<ScrollPage> {
        if batch_size == 0 {
            return Err(ScrollError::InvalidBatchSize {
                requested: batch_size,
            }
            .into());
        }
        if batch_size > self.max_batch_size {
            return Err(ScrollError::BatchSizeExceeded {
                requested: batch_size,
                max: self.max_batch_size,
            }
            .into());
        }

        let span = tracing::info_span!("scroll", container = %container_id, token = %token);
        self.run(principal, container_id, token, batch_size, keep_alive)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        principal: &Principal,
        container_id: &DocumentId,
        token: &ScrollToken,
        batch_size: usize,
        keep_alive: Duration,
    ) -> VellumResult<ScrollPage> {
        let mut phases = PhaseLog::new();
        let mut permit = self.acquire_permit().await?;
        phases.enter(ScrollPhase::PermitAcquired);

        let Some(container) = self.store.fetch(container_id).await? else {
            return Err(ScrollError::ContainerNotFound {
                container_id: container_id.clone(),
            }
            .into());
        };
        if !container.acl.permits(principal) {
            return Err(StorageError::AccessDenied {
                id: container_id.clone(),
                principal: principal.name.clone(),
            }
            .into());
        }
        let container_node = Node::adapt(&container, None, NodeKind::Folder);

        let mut token = token.clone();
        let mut skipped = 0;
        let mut barren = 0;
        // A batch whose records are all skipped must not read as the end
        loop {
            phases.enter(if token.is_empty() {
                ScrollPhase::Querying
            } else {
                ScrollPhase::Extracting
            });
            let pending = self
                .contexts
                .next_batch(container_id, &token, batch_size, keep_alive)
                .await?;
            token = pending.token.clone();

            if pending.is_empty() {
                self.contexts.finish(&token);
                phases.enter(ScrollPhase::Done);
                return Ok(ScrollPage {
                    items: Vec::new(),
                    scroll_token: token,
                    skipped,
                });
            }

            phases.enter(ScrollPhase::Fetching);
            let records = self.fetcher.fetch(&pending.ids).await?;

            phases.enter(ScrollPhase::Adapting);
            let adapted = self.resolver.adapt(records, &container_node, principal).await?;

            skipped += pending.ids.len().saturating_sub(adapted.nodes.len());
            tracing::debug!(
                ids = pending.ids.len(),
                items = adapted.nodes.len(),
                remaining = pending.remaining_after(),
                "Scroll batch adapted"
            );
            self.contexts.commit(pending);

            if !adapted.nodes.is_empty() {
                phases.enter(ScrollPhase::Done);
                return Ok(ScrollPage {
                    items: adapted.nodes,
                    scroll_token: token,
                    skipped,
                });
            }

            barren += 1;
            if barren % SKIPPED_BATCHES_PER_PERMIT == 0 {
                drop(permit);
                tracing::debug!(skipped, "Requeueing for a permit after skipped batches");
                permit = self.acquire_permit().await?;
                phases.enter(ScrollPhase::PermitAcquired);
            }
        }
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, ScrollError> {
        let acquire = self.permits.acquire();
        let acquired = match self.permit_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| ScrollError::PermitTimeout { waited: limit })?,
            None => acquire.await,
        };
        acquired.map_err(|_| ScrollError::Interrupted)
    }
}

// ============================================================================
// TESTS
// ============================================================================
