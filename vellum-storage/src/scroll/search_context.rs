//! Server-side state of descendant scrolls.
//!
//! A search context is an immutable snapshot of the descendant ids taken on
//! the first call of a scroll, plus a cursor into it. Batches are handed out
//! as [`PendingBatch`]es; the cursor only moves when the batch is committed,
//! so a batch whose fetch fails is delivered again on retry.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use vellum_core::{DocumentId, ScrollError, ScrollToken, VellumResult};

use crate::cache::{Cache, TtlCache};
use crate::RecordStore;

#[derive(Debug, Clone)]
struct SearchContext {
    container_id: DocumentId,
    ids: Arc<[DocumentId]>,
    cursor: usize,
    keep_alive: Duration,
}

impl SearchContext {
    fn remaining(&self) -> usize {
        self.ids.len().saturating_sub(self.cursor)
    }
}

/// Ids extracted for one scroll call, not yet marked as delivered.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub token: ScrollToken,
    pub ids: Vec<DocumentId>,
    /// Whether this call created the context.
    pub created: bool,
    context: SearchContext,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids left after this batch is committed.
    pub fn remaining_after(&self) -> usize {
        self.context.remaining()
    }
}

/// Scroll token to search context map.
pub struct SearchContextCache<S: RecordStore> {
    store: Arc<S>,
    contexts: Arc<TtlCache<ScrollToken, SearchContext>>,
    default_keep_alive: Duration,
}

impl<S: RecordStore> SearchContextCache<S> {
    /// `default_keep_alive` applies when a caller passes a zero keep-alive.
    pub fn new(store: Arc<S>, default_keep_alive: Duration, max_entries: usize) -> Self {
        Self {
            store,
            contexts: Arc::new(TtlCache::new(
                "scroll.contexts",
                default_keep_alive,
                max_entries,
                2,
            )),
            default_keep_alive,
        }
    }

    /// Next `batch_size` ids of the scroll identified by `token`.
    ///
    /// An empty token starts a new scroll: the descendant query runs once
    /// and its result is snapshotted under a fresh token. A non-empty token
    /// must name a live context for `container_id`.
    pub async fn next_batch(
        &self,
        container_id: &DocumentId,
        token: &ScrollToken,
        batch_size: usize,
        keep_alive: Duration,
    ) -> VellumResult<PendingBatch> {
        let keep_alive = if keep_alive.is_zero() {
            self.default_keep_alive
        } else {
            keep_alive
        };

        let (token, mut context, created) = if token.is_empty() {
            let ids = self.store.query_descendant_ids(container_id).await?;
            tracing::debug!(container = %container_id, total = ids.len(), "Opened search context");
            let context = SearchContext {
                container_id: container_id.clone(),
                ids: ids.into(),
                cursor: 0,
                keep_alive,
            };
            (ScrollToken::generate(), context, true)
        } else {
            let Some(mut context) = self.contexts.get(token) else {
                return Err(ScrollError::UnknownScrollToken {
                    token: token.clone(),
                }
                .into());
            };
            if &context.container_id != container_id {
                tracing::warn!(
                    token = %token,
                    expected = %context.container_id,
                    container = %container_id,
                    "Scroll token used with another container"
                );
                return Err(ScrollError::UnknownScrollToken {
                    token: token.clone(),
                }
                .into());
            }
            context.keep_alive = keep_alive;
            (token.clone(), context, false)
        };

        let end = context.cursor.saturating_add(batch_size).min(context.ids.len());
        let ids = context.ids[context.cursor..end].to_vec();
        context.cursor = end;

        Ok(PendingBatch {
            token,
            ids,
            created,
            context,
        })
    }

    /// Mark the batch as delivered and refresh the context's lifetime.
    pub fn commit(&self, batch: PendingBatch) {
        let keep_alive = batch.context.keep_alive;
        self.contexts.put_with_ttl(batch.token, batch.context, keep_alive);
    }

    /// Drop a context. Unknown tokens are ignored.
    pub fn finish(&self, token: &ScrollToken) {
        if self.contexts.invalidate(token) {
            tracing::debug!(token = %token, "Closed search context");
        }
    }

    /// Ids not yet delivered for `token`, or `None` if it is unknown.
    pub fn remaining(&self, token: &ScrollToken) -> Option<usize> {
        self.contexts.get(token).map(|c| c.remaining())
    }

    /// Number of stored contexts, expired ones included.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Periodically drop abandoned contexts.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        self.contexts.spawn_sweeper(period)
    }

    pub fn clear(&self) {
        self.contexts.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRecordStore;
    use vellum_core::{DocumentRecord, VellumError};

    fn store_with(n: usize) -> (Arc<InMemoryRecordStore>, DocumentId) {
        let store = InMemoryRecordStore::new();
        let root = DocumentRecord::root(DocumentId::from("root"));
        for i in 0..n {
            store
                .insert(DocumentRecord::child_of(&root, format!("doc-{i}"), "File"))
                .unwrap();
        }
        let id = root.id.clone();
        store.insert(root).unwrap();
        (Arc::new(store), id)
    }

    fn contexts(store: Arc<InMemoryRecordStore>) -> SearchContextCache<InMemoryRecordStore> {
        SearchContextCache::new(store, Duration::from_secs(60), 16)
    }

    #[tokio::test]
    async fn test_batches_are_disjoint_and_ordered() {
        let (store, root) = store_with(5);
        let contexts = contexts(store.clone());

        let first = contexts
            .next_batch(&root, &ScrollToken::empty(), 2, Duration::ZERO)
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.ids.len(), 2);
        let token = first.token.clone();
        let first_ids = first.ids.clone();
        contexts.commit(first);

        let second = contexts.next_batch(&root, &token, 2, Duration::ZERO).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.token, token);
        assert!(second.ids.iter().all(|id| !first_ids.contains(id)));
        contexts.commit(second);

        assert_eq!(contexts.remaining(&token), Some(1));
        assert_eq!(store.descendant_queries(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_repeated() {
        let (store, root) = store_with(3);
        let contexts = contexts(store);
        let first = contexts
            .next_batch(&root, &ScrollToken::empty(), 1, Duration::ZERO)
            .await
            .unwrap();
        let token = first.token.clone();
        contexts.commit(first);

        let attempt = contexts.next_batch(&root, &token, 1, Duration::ZERO).await.unwrap();
        let retry = contexts.next_batch(&root, &token, 1, Duration::ZERO).await.unwrap();
        assert_eq!(attempt.ids, retry.ids);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (store, root) = store_with(1);
        let contexts = contexts(store);
        let token = ScrollToken::new("nope");
        let err = contexts
            .next_batch(&root, &token, 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err, VellumError::Scroll(ScrollError::UnknownScrollToken { token }));
    }

    #[tokio::test]
    async fn test_token_is_bound_to_its_container() {
        let (store, root) = store_with(3);
        let contexts = contexts(store);
        let first = contexts
            .next_batch(&root, &ScrollToken::empty(), 1, Duration::ZERO)
            .await
            .unwrap();
        let token = first.token.clone();
        contexts.commit(first);

        let err = contexts
            .next_batch(&DocumentId::from("elsewhere"), &token, 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::Scroll(ScrollError::UnknownScrollToken { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_bounds_lifetime() {
        let (store, root) = store_with(3);
        let contexts = contexts(store);
        let first = contexts
            .next_batch(&root, &ScrollToken::empty(), 1, Duration::from_secs(5))
            .await
            .unwrap();
        let token = first.token.clone();
        contexts.commit(first);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = contexts
            .next_batch(&root, &token, 1, Duration::from_secs(5))
            .await
            .unwrap();
        contexts.commit(second);

        // Refreshed by the second commit
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(contexts.remaining(&token), Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(contexts.remaining(&token), None);
    }

    #[tokio::test]
    async fn test_finish_forgets_token() {
        let (store, root) = store_with(1);
        let contexts = contexts(store);
        let first = contexts
            .next_batch(&root, &ScrollToken::empty(), 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.remaining_after(), 0);
        let token = first.token.clone();
        contexts.commit(first);
        contexts.finish(&token);
        assert!(contexts.is_empty());
    }
}
