//! Writer listener: turns scene mutations into store writes.
//!
//! Each mutation takes the write lock, so mutations are applied in the
//! order they acquire it and writes for one uid are never reordered.
//! A listener that has been detached by a swap drops mutations instead of
//! writing them; the check happens under the write lock, so nothing can
//! slip through between a detach and the store being replaced.
//!
//! Write errors are logged and reported as [`WriteOutcome::Failed`]. They
//! never reach the caller as errors and never affect later writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use statesaver_db::{StoreHandle, Upsert};

use crate::scene::SceneMutation;

/// What happened to one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was written with this id.
    Inserted(i64),
    /// The latest row for the uid, with this id, was replaced.
    Updated(i64),
    /// This many rows were deleted.
    Removed(u64),
    /// The listener was detached; nothing was written.
    Detached,
    /// The write failed and was logged.
    Failed,
}

impl From<Upsert> for WriteOutcome {
    fn from(upsert: Upsert) -> Self {
        match upsert {
            Upsert::Inserted(id) => Self::Inserted(id),
            Upsert::Updated(id) => Self::Updated(id),
        }
    }
}

/// Persists scene mutations into the active store.
#[derive(Debug)]
pub struct WriterListener {
    handle: Arc<StoreHandle>,
    detached: AtomicBool,
}

impl WriterListener {
    /// Create an attached listener writing through `handle`.
    pub const fn new(handle: Arc<StoreHandle>) -> Self {
        Self {
            handle,
            detached: AtomicBool::new(false),
        }
    }

    /// Whether this listener has stopped writing.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Stop writing. Permanent; a swap attaches a fresh listener instead.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Apply one mutation.
    pub async fn on_mutation(&self, mutation: &SceneMutation) -> WriteOutcome {
        let mut guard = self.handle.write().await;
        if self.is_detached() {
            tracing::debug!(uid = mutation.uid(), "Listener detached; dropping mutation");
            return WriteOutcome::Detached;
        }

        let result = match mutation {
            SceneMutation::Persist(event) => guard.upsert(event).await.map(WriteOutcome::from),
            SceneMutation::Remove { uid } => guard.delete(uid).await.map(WriteOutcome::Removed),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(uid = mutation.uid(), error = %e, "Failed to persist mutation");
                WriteOutcome::Failed
            }
        }
    }
}
