//! An open event database.
//!
//! [`EventStore::open`] connects through a [`StorageProvider`], quarantines
//! a database that cannot be opened, and migrates the schema before the
//! store is handed out. Reads are available to anyone holding the store.
//! Mutations are crate-private: they are only reachable through a
//! [`WriteGuard`](crate::WriteGuard), which serializes them.
//!
//! Uses [`sqlx`] with runtime query construction. All values are bound
//! parameters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::{Executor, Sqlite, SqlitePool};
use statesaver_types::{EventRecord, GeoPoint, NewEvent};

use crate::error::DbError;
use crate::migration::{MigrationReport, Migrator};
use crate::provider::StorageProvider;
use crate::registry::ClassificationRegistry;

macro_rules! select_events {
    ($tail:literal) => {
        concat!(
            "SELECT id, uid, type, raw_payload, derived_payload, visible, last_update, \
             query_order, longitude, latitude FROM events ",
            $tail
        )
    };
}

/// Row as read from the `events` table.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    uid: String,
    #[sqlx(rename = "type")]
    event_type: String,
    raw_payload: String,
    derived_payload: String,
    visible: bool,
    last_update: i64,
    query_order: i32,
    longitude: f64,
    latitude: f64,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            uid: row.uid,
            event_type: row.event_type,
            raw_payload: row.raw_payload,
            derived_payload: row.derived_payload,
            visible: row.visible,
            last_update: row.last_update,
            query_order: row.query_order,
            geometry: GeoPoint::new(row.longitude, row.latitude),
        }
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new row was written with this id.
    Inserted(i64),
    /// The latest row for the uid, with this id, was replaced.
    Updated(i64),
}

/// Position in replay order: the last row handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayCursor {
    /// Priority of the last row.
    pub query_order: i32,
    /// Id of the last row.
    pub id: i64,
}

impl From<&EventRecord> for ReplayCursor {
    fn from(record: &EventRecord) -> Self {
        Self {
            query_order: record.query_order,
            id: record.id,
        }
    }
}

/// An open, migrated event database.
#[derive(Debug)]
pub struct EventStore {
    pool: SqlitePool,
    provider: Arc<dyn StorageProvider>,
    migration: MigrationReport,
    quarantined: Option<PathBuf>,
    closed: AtomicBool,
}

impl EventStore {
    /// Open the database behind `provider` and migrate it.
    ///
    /// A database that cannot be opened is moved aside with
    /// [`StorageProvider::quarantine`] and a fresh one is created in its
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if even the fresh database cannot be
    /// opened, [`DbError::Io`] if quarantine fails, and
    /// [`DbError::Migration`] if the schema migration is rolled back.
    pub async fn open(
        provider: Arc<dyn StorageProvider>,
        registry: &ClassificationRegistry,
    ) -> Result<Self, DbError> {
        let (pool, quarantined) = match connect(provider.as_ref()).await {
            Ok(pool) => (pool, None),
            Err(e) => {
                tracing::warn!(
                    location = %provider.describe(),
                    error = %e,
                    "Event store failed to open"
                );
                let moved = provider.quarantine()?;
                (connect(provider.as_ref()).await?, moved)
            }
        };

        let migration = match Migrator::new(registry).migrate(&pool).await {
            Ok(report) => report,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        tracing::info!(
            location = %provider.describe(),
            schema_version = migration.to_version,
            quarantined = quarantined.is_some(),
            "Opened event store"
        );

        Ok(Self {
            pool,
            provider,
            migration,
            quarantined,
            closed: AtomicBool::new(false),
        })
    }

    /// Provider this store was opened through.
    pub const fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Location of the backing database, for logs.
    pub fn describe(&self) -> String {
        self.provider.describe()
    }

    /// What the migrator did when this store was opened.
    pub const fn migration(&self) -> &MigrationReport {
        &self.migration
    }

    /// Where a corrupt predecessor was moved when this store was opened.
    pub fn quarantined(&self) -> Option<&Path> {
        self.quarantined.as_deref()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stream every row in id order.
    pub fn scan_all(&self) -> BoxStream<'_, Result<EventRecord, DbError>> {
        self.stream_rows(select_events!("ORDER BY id"))
    }

    /// Stream every row in replay order: highest `query_order` first,
    /// ties broken by ascending id.
    pub fn scan_replay_order(&self) -> BoxStream<'_, Result<EventRecord, DbError>> {
        self.stream_rows(select_events!("ORDER BY query_order DESC, id ASC"))
    }

    fn stream_rows(&self, sql: &'static str) -> BoxStream<'_, Result<EventRecord, DbError>> {
        sqlx::query_as::<_, EventRow>(sql)
            .fetch(&self.pool)
            .map(|row| row.map(EventRecord::from).map_err(DbError::from))
            .boxed()
    }

    /// Up to `limit` rows in replay order, starting after `after`.
    ///
    /// Unlike [`scan_replay_order`](Self::scan_replay_order) the connection
    /// is released as soon as the page is read, so other pool users are
    /// not held up between pages.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub async fn replay_page(
        &self,
        after: Option<ReplayCursor>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, DbError> {
        let rows = match after {
            None => {
                sqlx::query_as::<_, EventRow>(select_events!(
                    "ORDER BY query_order DESC, id ASC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor) => {
                sqlx::query_as::<_, EventRow>(select_events!(
                    "WHERE query_order < ? OR (query_order = ? AND id > ?) \
                     ORDER BY query_order DESC, id ASC LIMIT ?"
                ))
                .bind(cursor.query_order)
                .bind(cursor.query_order)
                .bind(cursor.id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    /// Latest row written for `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub async fn lookup_by_uid(&self, uid: &str) -> Result<Option<EventRecord>, DbError> {
        let row = sqlx::query_as::<_, EventRow>(select_events!(
            "WHERE uid = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EventRecord::from))
    }

    /// Distinct uids present in the store.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub async fn uids(&self) -> Result<Vec<String>, DbError> {
        let uids = sqlx::query_scalar::<_, String>("SELECT DISTINCT uid FROM events ORDER BY uid")
            .fetch_all(&self.pool)
            .await?;
        Ok(uids)
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub async fn count(&self) -> Result<u64, DbError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Schema version currently recorded on disk.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the pragma cannot be read.
    pub async fn schema_version(&self) -> Result<i64, DbError> {
        Migrator::current_version(&self.pool).await
    }

    /// Compact the database and release the pool.
    ///
    /// Blocks until readers holding connections finish. Calling this more
    /// than once is a no-op. Compaction failures are logged and ignored.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
            tracing::debug!(location = %self.describe(), error = %e, "Compaction skipped");
        }
        self.pool.close().await;
        tracing::info!(location = %self.describe(), "Closed event store");
    }

    /// Release the pool without compacting. Used before destroying the
    /// backing file.
    pub(crate) async fn close_without_compaction(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::Closed(self.describe()));
        }
        Ok(())
    }

    pub(crate) async fn insert(
        &self,
        event: &NewEvent,
        registry: &ClassificationRegistry,
    ) -> Result<i64, DbError> {
        self.ensure_open()?;
        let query_order = registry.lookup(event.event_type());
        let id = insert_event(&self.pool, None, event, query_order).await?;
        tracing::debug!(id, uid = event.uid(), "Inserted event");
        Ok(id)
    }

    /// Replace the latest row for `uid`. Returns `false` if there is none.
    pub(crate) async fn update(
        &self,
        uid: &str,
        event: &NewEvent,
        registry: &ClassificationRegistry,
    ) -> Result<bool, DbError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        let Some(id) = latest_id(&mut *tx, uid).await? else {
            return Ok(false);
        };
        update_event(&mut *tx, id, event, registry.lookup(event.event_type())).await?;
        tx.commit().await?;
        tracing::debug!(id, uid, "Updated event");
        Ok(true)
    }

    pub(crate) async fn upsert(
        &self,
        event: &NewEvent,
        registry: &ClassificationRegistry,
    ) -> Result<Upsert, DbError> {
        self.ensure_open()?;
        let query_order = registry.lookup(event.event_type());
        let mut tx = self.pool.begin().await?;
        let outcome = match latest_id(&mut *tx, event.uid()).await? {
            Some(id) => {
                update_event(&mut *tx, id, event, query_order).await?;
                Upsert::Updated(id)
            }
            None => Upsert::Inserted(insert_event(&mut *tx, None, event, query_order).await?),
        };
        tx.commit().await?;
        tracing::debug!(uid = event.uid(), ?outcome, "Persisted event");
        Ok(outcome)
    }

    /// Delete every row for `uid`. Returns the number of rows removed.
    pub(crate) async fn delete(&self, uid: &str) -> Result<u64, DbError> {
        self.ensure_open()?;
        let removed = sqlx::query("DELETE FROM events WHERE uid = ?")
            .bind(uid)
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::debug!(uid, removed, "Deleted events");
        Ok(removed)
    }

    /// Recompute `query_order` for every row whose type starts with
    /// `prefix`. Returns the number of rows rewritten.
    pub(crate) async fn rewrite_query_order(
        &self,
        prefix: &str,
        registry: &ClassificationRegistry,
    ) -> Result<u64, DbError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        let types = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT type FROM events WHERE substr(type, 1, length(?1)) = ?1",
        )
        .bind(prefix)
        .fetch_all(&mut *tx)
        .await?;

        let mut rewritten: u64 = 0;
        for event_type in &types {
            let affected = sqlx::query("UPDATE events SET query_order = ? WHERE type = ?")
                .bind(registry.lookup(event_type))
                .bind(event_type)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            rewritten = rewritten.saturating_add(affected);
        }
        tx.commit().await?;

        tracing::debug!(prefix, types = types.len(), rows = rewritten, "Rewrote replay priority");
        Ok(rewritten)
    }
}

async fn connect(provider: &dyn StorageProvider) -> Result<SqlitePool, DbError> {
    let pool = provider
        .pool_options()
        .connect_with(provider.connect_options()?)
        .await?;

    // Opening is lazy about the file header; force a read of the schema.
    if let Err(e) = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sqlite_master")
        .fetch_one(&pool)
        .await
    {
        pool.close().await;
        return Err(e.into());
    }
    Ok(pool)
}

async fn latest_id<'e, E>(executor: E, uid: &str) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(id) FROM events WHERE uid = ?")
        .bind(uid)
        .fetch_one(executor)
        .await
}

/// Insert one row. With `id` of `None` the database assigns the next id.
pub(crate) async fn insert_event<'e, E>(
    executor: E,
    id: Option<i64>,
    event: &NewEvent,
    query_order: i32,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let geometry = event.geometry();
    let result = sqlx::query(
        r"INSERT INTO events (id, uid, type, raw_payload, derived_payload, visible, last_update, query_order, longitude, latitude)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(event.uid())
    .bind(event.event_type())
    .bind(event.raw_payload())
    .bind(event.derived_payload())
    .bind(event.visible())
    .bind(event.last_update())
    .bind(query_order)
    .bind(geometry.longitude)
    .bind(geometry.latitude)
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn update_event<'e, E>(
    executor: E,
    id: i64,
    event: &NewEvent,
    query_order: i32,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let geometry = event.geometry();
    sqlx::query(
        r"UPDATE events
          SET type = ?, raw_payload = ?, derived_payload = ?, visible = ?, last_update = ?,
              query_order = ?, longitude = ?, latitude = ?
          WHERE id = ?",
    )
    .bind(event.event_type())
    .bind(event.raw_payload())
    .bind(event.derived_payload())
    .bind(event.visible())
    .bind(event.last_update())
    .bind(query_order)
    .bind(geometry.longitude)
    .bind(geometry.latitude)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::provider::MemoryProvider;

    async fn memory_store(registry: &ClassificationRegistry) -> EventStore {
        EventStore::open(Arc::new(MemoryProvider::new("store-test")), registry)
            .await
            .unwrap()
    }

    fn event(uid: &str, event_type: &str) -> NewEvent {
        NewEvent::new(uid, event_type, format!("{{\"uid\":\"{uid}\"}}")).unwrap()
    }

    #[tokio::test]
    async fn fresh_store_is_at_current_version() {
        let registry = ClassificationRegistry::with_defaults();
        let store = memory_store(&registry).await;
        assert_eq!(store.schema_version().await.unwrap(), crate::SCHEMA_VERSION);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.quarantined().is_none());
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let registry = ClassificationRegistry::new();
        let store = memory_store(&registry).await;
        let a = store.insert(&event("u1", "a-f-G"), &registry).await.unwrap();
        let b = store.insert(&event("u1", "a-f-G"), &registry).await.unwrap();
        store.delete("u1").await.unwrap();
        let c = store.insert(&event("u2", "a-f-G"), &registry).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn upsert_replaces_latest_row() {
        let registry = ClassificationRegistry::new();
        let store = memory_store(&registry).await;

        let first = store.upsert(&event("u1", "a-f-G"), &registry).await.unwrap();
        let Upsert::Inserted(id) = first else {
            panic!("expected insert, got {first:?}");
        };
        let second = store.upsert(&event("u1", "a-h-G"), &registry).await.unwrap();
        assert_eq!(second, Upsert::Updated(id));

        let latest = store.lookup_by_uid("u1").await.unwrap().unwrap();
        assert_eq!(latest.event_type, "a-h-G");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_without_row_reports_false() {
        let registry = ClassificationRegistry::new();
        let store = memory_store(&registry).await;
        assert!(!store.update("nobody", &event("nobody", "a"), &registry).await.unwrap());
    }

    #[tokio::test]
    async fn replay_order_puts_priority_first() {
        let registry = ClassificationRegistry::with_defaults();
        let store = memory_store(&registry).await;
        store.insert(&event("plain", "a-f-G"), &registry).await.unwrap();
        store.insert(&event("jump", "b-m-p-j"), &registry).await.unwrap();
        store.insert(&event("route", "b-m-r"), &registry).await.unwrap();

        let uids: Vec<String> = store
            .scan_replay_order()
            .map_ok(|r| r.uid)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(uids, ["route", "jump", "plain"]);
    }

    #[tokio::test]
    async fn replay_pages_walk_the_same_order_as_the_scan() {
        let registry = ClassificationRegistry::with_defaults();
        let store = memory_store(&registry).await;
        for (uid, event_type) in [
            ("p1", "a-f-G"),
            ("j1", "b-m-p-j"),
            ("r1", "b-m-r"),
            ("p2", "a-h-G"),
            ("j2", "b-m-p-j"),
        ] {
            store.insert(&event(uid, event_type), &registry).await.unwrap();
        }

        let mut paged = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.replay_page(cursor, 2).await.unwrap();
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(ReplayCursor::from(last));
            paged.extend(page.into_iter().map(|r| r.uid));
        }

        let scanned: Vec<String> = store
            .scan_replay_order()
            .map_ok(|r| r.uid)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(paged, ["r1", "j1", "j2", "p1", "p2"]);
        assert_eq!(paged, scanned);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let registry = ClassificationRegistry::new();
        let store = memory_store(&registry).await;
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
        let err = store.insert(&event("u1", "a"), &registry).await.unwrap_err();
        assert!(matches!(err, DbError::Closed(_)));
    }
}
