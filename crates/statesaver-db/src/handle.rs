//! The process-wide write lock around the active store.
//!
//! [`StoreHandle`] owns the active provider, the lazily opened
//! [`EventStore`] and the [`ClassificationRegistry`]. Every mutation goes
//! through a [`WriteGuard`], so at most one of them runs at a time:
//! inserts, updates, deletes, registry rewrites, provider installs and
//! zeroize all contend on the same lock.
//!
//! Readers only need an `Arc<EventStore>` and never take the lock.

use std::sync::Arc;

use statesaver_types::{EventRecord, NewEvent};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::DbError;
use crate::provider::StorageProvider;
use crate::registry::ClassificationRegistry;
use crate::store::{EventStore, Upsert};

#[derive(Debug)]
struct StoreSlot {
    provider: Arc<dyn StorageProvider>,
    store: Option<Arc<EventStore>>,
}

/// Owner of the active store and the write lock.
#[derive(Debug)]
pub struct StoreHandle {
    slot: Mutex<StoreSlot>,
    registry: ClassificationRegistry,
}

impl StoreHandle {
    /// Create a handle over `provider`. Nothing is opened until first use.
    pub fn new(provider: Arc<dyn StorageProvider>, registry: ClassificationRegistry) -> Self {
        Self {
            slot: Mutex::new(StoreSlot {
                provider,
                store: None,
            }),
            registry,
        }
    }

    /// The classification registry shared by every store this handle opens.
    pub const fn registry(&self) -> &ClassificationRegistry {
        &self.registry
    }

    /// Take the write lock.
    pub async fn write(&self) -> WriteGuard<'_> {
        WriteGuard {
            slot: self.slot.lock().await,
            registry: &self.registry,
        }
    }

    /// The active store, opening it if necessary.
    ///
    /// # Errors
    ///
    /// Returns whatever [`EventStore::open`] returns.
    pub async fn open(&self) -> Result<Arc<EventStore>, DbError> {
        self.write().await.store().await
    }

    /// The active store if one is open. Never opens.
    pub async fn current(&self) -> Option<Arc<EventStore>> {
        self.slot.lock().await.store.clone()
    }

    /// The active provider.
    pub async fn provider(&self) -> Arc<dyn StorageProvider> {
        Arc::clone(&self.slot.lock().await.provider)
    }

    /// Latest row for `uid` in the active store, opening it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be opened or queried.
    pub async fn lookup_by_uid(&self, uid: &str) -> Result<Option<EventRecord>, DbError> {
        let store = self.open().await?;
        store.lookup_by_uid(uid).await
    }

    /// Register a classification and rewrite persisted priorities.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the rewrite fails.
    pub async fn register_classification(
        &self,
        prefix: &str,
        priority: i32,
    ) -> Result<u64, DbError> {
        self.write()
            .await
            .register_classification(prefix, priority)
            .await
    }

    /// Close the active store, if any. The provider stays installed and the
    /// next write reopens it.
    pub async fn shutdown(&self) {
        let store = self.write().await.take();
        if let Some(store) = store {
            store.close().await;
        }
    }

    /// Close the active store and destroy its backing database.
    ///
    /// The next write opens a fresh, empty store on the same provider.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] if the backing file cannot be removed.
    pub async fn zeroize(&self) -> Result<(), DbError> {
        let mut guard = self.write().await;
        if let Some(store) = guard.take() {
            store.close_without_compaction().await;
        }
        let provider = Arc::clone(guard.provider());
        provider.destroy()?;
        tracing::warn!(location = %provider.describe(), "Event store zeroized");
        Ok(())
    }
}

/// Exclusive access to the active store.
///
/// Dropping the guard releases the write lock.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    slot: MutexGuard<'a, StoreSlot>,
    registry: &'a ClassificationRegistry,
}

impl WriteGuard<'_> {
    /// The active store, opening it through the active provider if needed.
    ///
    /// # Errors
    ///
    /// Returns whatever [`EventStore::open`] returns.
    pub async fn store(&mut self) -> Result<Arc<EventStore>, DbError> {
        if let Some(store) = &self.slot.store {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(
            EventStore::open(Arc::clone(&self.slot.provider), self.registry).await?,
        );
        self.slot.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// The active store if one is open.
    pub fn current(&self) -> Option<&Arc<EventStore>> {
        self.slot.store.as_ref()
    }

    /// The active provider.
    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.slot.provider
    }

    /// The classification registry.
    pub const fn registry(&self) -> &ClassificationRegistry {
        self.registry
    }

    /// Append a row. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be opened or written.
    pub async fn insert(&mut self, event: &NewEvent) -> Result<i64, DbError> {
        let store = self.store().await?;
        store.insert(event, self.registry).await
    }

    /// Replace the latest row for `uid`. Returns `false` if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be opened or written.
    pub async fn update(&mut self, uid: &str, event: &NewEvent) -> Result<bool, DbError> {
        let store = self.store().await?;
        store.update(uid, event, self.registry).await
    }

    /// Replace the latest row for the event's uid, or append one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be opened or written.
    pub async fn upsert(&mut self, event: &NewEvent) -> Result<Upsert, DbError> {
        let store = self.store().await?;
        store.upsert(event, self.registry).await
    }

    /// Delete every row for `uid`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be opened or written.
    pub async fn delete(&mut self, uid: &str) -> Result<u64, DbError> {
        let store = self.store().await?;
        store.delete(uid).await
    }

    /// Register `prefix` and rewrite `query_order` of matching rows in the
    /// open store. With no open store only the registry changes.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the rewrite fails.
    pub async fn register_classification(
        &mut self,
        prefix: &str,
        priority: i32,
    ) -> Result<u64, DbError> {
        let previous = self.registry.register(prefix, priority);
        tracing::info!(prefix, priority, ?previous, "Registered classification");
        match &self.slot.store {
            Some(store) => store.rewrite_query_order(prefix, self.registry).await,
            None => Ok(0),
        }
    }

    /// Make `store`, opened through `provider`, the active store.
    ///
    /// Returns the store it replaces. The caller is responsible for
    /// closing it.
    pub fn install(
        &mut self,
        provider: Arc<dyn StorageProvider>,
        store: Arc<EventStore>,
    ) -> Option<Arc<EventStore>> {
        tracing::info!(
            from = %self.slot.provider.describe(),
            to = %provider.describe(),
            "Installing storage provider"
        );
        self.slot.provider = provider;
        self.slot.store.replace(store)
    }

    /// Detach the active store without closing it.
    pub fn take(&mut self) -> Option<Arc<EventStore>> {
        self.slot.store.take()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn handle() -> StoreHandle {
        StoreHandle::new(
            Arc::new(MemoryProvider::new("handle-test")),
            ClassificationRegistry::with_defaults(),
        )
    }

    #[tokio::test]
    async fn store_opens_lazily() {
        let handle = handle();
        assert!(handle.current().await.is_none());
        handle.open().await.unwrap();
        assert!(handle.current().await.is_some());
    }

    #[tokio::test]
    async fn registration_without_store_only_touches_registry() {
        let handle = handle();
        let rewritten = handle.register_classification("a-h", 4).await.unwrap();
        assert_eq!(rewritten, 0);
        assert_eq!(handle.registry().lookup("a-h-G"), 4);
        assert!(handle.current().await.is_none());
    }

    #[tokio::test]
    async fn install_returns_previous_store() {
        let handle = handle();
        let old = handle.open().await.unwrap();

        let provider: Arc<dyn StorageProvider> = Arc::new(MemoryProvider::new("next"));
        let next = Arc::new(
            EventStore::open(Arc::clone(&provider), handle.registry())
                .await
                .unwrap(),
        );

        let replaced = handle.write().await.install(provider, Arc::clone(&next));
        assert!(Arc::ptr_eq(&replaced.unwrap(), &old));
        assert!(Arc::ptr_eq(&handle.current().await.unwrap(), &next));
        assert_eq!(handle.provider().await.describe(), "memory:next");
    }

    #[tokio::test]
    async fn shutdown_closes_and_detaches() {
        let handle = handle();
        let store = handle.open().await.unwrap();
        handle.shutdown().await;
        assert!(store.is_closed());
        assert!(handle.current().await.is_none());
    }
}
