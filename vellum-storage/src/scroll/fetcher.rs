//! Bounded multi-fetch.

use std::sync::Arc;
use vellum_core::{DocumentId, DocumentRecord, VellumResult};

use crate::RecordStore;

/// Fetches records in sub-chunks of at most `chunk_size` ids.
///
/// Chunk order is preserved in the output. Ids that no longer resolve are
/// omitted. Any backend error aborts the whole fetch; partial results are
/// never returned.
pub struct ChunkedFetcher<S: RecordStore> {
    store: Arc<S>,
    chunk_size: usize,
}

impl<S: RecordStore> ChunkedFetcher<S> {
    pub fn new(store: Arc<S>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn fetch(&self, ids: &[DocumentId]) -> VellumResult<Vec<DocumentRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.chunk_size) {
            records.extend(self.store.fetch_many(chunk).await?);
        }
        // A store may answer with more rows than ids, e.g. duplicates
        let missing = ids.len().saturating_sub(records.len());
        if missing > 0 {
            tracing::debug!(requested = ids.len(), missing, "Ids vanished before fetch");
        }
        Ok(records)
    }
}
