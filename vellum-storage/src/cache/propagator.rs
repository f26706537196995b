//! Local invalidation fan-out between connections of one process.
//!
//! Per-connection caches cannot be evicted by another connection directly,
//! so invalidations are published here and each connection drains its
//! subscription before touching its caches.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use vellum_core::InvalidationMessage;

/// Messages collected from one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationBatch {
    pub messages: Vec<InvalidationMessage>,
    /// Every cached entry must be dropped, either because messages were lost
    /// or because a full flush was requested.
    pub flush: bool,
}

impl InvalidationBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && !self.flush
    }
}

#[derive(Debug, Clone)]
enum Notice {
    Evict(InvalidationMessage),
    Flush,
}

/// Broadcasts invalidations to every subscribed connection.
#[derive(Debug, Clone)]
pub struct InvalidationPropagator {
    tx: broadcast::Sender<Notice>,
}

impl InvalidationPropagator {
    /// `capacity` bounds how far a subscriber may fall behind before it
    /// must flush.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Never blocks.
    pub fn propagate(&self, message: InvalidationMessage) {
        self.notify(Notice::Evict(message));
    }

    /// Ask every subscriber to drop all of its entries.
    pub fn flush_all(&self) {
        self.notify(Notice::Flush);
    }

    fn notify(&self, notice: Notice) {
        // Err only means no connection is open
        if let Ok(receivers) = self.tx.send(notice) {
            tracing::trace!(receivers, "Propagated invalidation");
        }
    }

    pub fn subscribe(&self) -> InvalidationQueue {
        InvalidationQueue {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One connection's view of the propagator.
#[derive(Debug)]
pub struct InvalidationQueue {
    rx: broadcast::Receiver<Notice>,
}

impl InvalidationQueue {
    /// Take everything received since the last drain without waiting.
    pub fn drain(&mut self) -> InvalidationBatch {
        let mut batch = InvalidationBatch::default();
        loop {
            match self.rx.try_recv() {
                Ok(Notice::Evict(message)) => batch.messages.push(message),
                Ok(Notice::Flush) => batch.flush = true,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Invalidation queue lagged, flushing");
                    batch.flush = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        batch
    }
}
