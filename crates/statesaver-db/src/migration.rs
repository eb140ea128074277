//! Schema migration to [`SCHEMA_VERSION`].
//!
//! The on-disk version lives in `PRAGMA user_version`. Any store whose
//! version differs from the target is rebuilt in a single transaction:
//!
//! 1. drop a stale holding table left by an interrupted run
//! 2. copy `raw_payload` (plus `derived_payload`/`visible` when present)
//!    of every legacy row into the holding table
//! 3. drop indexes, the geometry registration and the primary table
//! 4. create the current table, indexes and geometry registration
//! 5. re-derive every row from its payload and insert it
//! 6. drop the holding table and stamp the new version
//!
//! A row whose payload cannot be re-derived is skipped with a warning and
//! the migration carries on. Any statement error rolls the whole
//! transaction back, leaving the previous schema and data untouched.
//!
//! The target is the same whichever side of it the store is on, so a store
//! written by a newer release is rebuilt down to this layout as well.

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use statesaver_types::NewEvent;

use crate::error::DbError;
use crate::registry::ClassificationRegistry;
use crate::schema::{
    CREATE_EVENTS, CREATE_GEOMETRY_COLUMNS, CREATE_HOLDING, CREATE_INDEXES, DISCARD_GEOMETRY,
    DROP_HOLDING, DROP_INDEXES, EVENTS_TABLE, GEOMETRY_COLUMN, GEOMETRY_SRID, HOLDING_TABLE,
    REGISTER_GEOMETRY, SCHEMA_VERSION,
};
use crate::store::insert_event;

/// Outcome of a [`Migrator::migrate`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version found on disk before the run.
    pub from_version: i64,
    /// Version on disk after the run.
    pub to_version: i64,
    /// Rows carried over into the new layout.
    pub migrated: u64,
    /// Legacy rows dropped because their payload could not be re-derived.
    pub skipped: u64,
}

impl MigrationReport {
    const fn current(version: i64) -> Self {
        Self {
            from_version: version,
            to_version: version,
            migrated: 0,
            skipped: 0,
        }
    }

    /// Whether the store was already at the target version.
    pub const fn was_current(&self) -> bool {
        self.from_version == self.to_version
    }
}

/// Legacy row as staged in the holding table.
#[derive(Debug, sqlx::FromRow)]
struct HoldingRow {
    legacy_id: Option<i64>,
    raw_payload: Option<String>,
    derived_payload: Option<String>,
    visible: Option<i64>,
}

/// Brings a database to [`SCHEMA_VERSION`].
#[derive(Debug, Clone, Copy)]
pub struct Migrator<'a> {
    registry: &'a ClassificationRegistry,
}

impl<'a> Migrator<'a> {
    /// Create a migrator that assigns `query_order` from `registry`.
    pub const fn new(registry: &'a ClassificationRegistry) -> Self {
        Self { registry }
    }

    /// Read the schema version recorded in the database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the pragma cannot be read.
    pub async fn current_version(pool: &SqlitePool) -> Result<i64, DbError> {
        let version = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
            .fetch_one(pool)
            .await?;
        Ok(version)
    }

    /// Rebuild the database at the target version if it is not already there.
    ///
    /// Running this twice is safe: the second run finds the target version
    /// and does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if any statement fails; the database
    /// is left exactly as it was before the call.
    pub async fn migrate(&self, pool: &SqlitePool) -> Result<MigrationReport, DbError> {
        let from = Self::current_version(pool).await?;
        if from == SCHEMA_VERSION {
            tracing::debug!(version = from, "Event store schema is current");
            return Ok(MigrationReport::current(from));
        }

        if from > SCHEMA_VERSION {
            tracing::warn!(
                from,
                to = SCHEMA_VERSION,
                "Event store was written by a newer release; rebuilding"
            );
        } else {
            tracing::info!(from, to = SCHEMA_VERSION, "Upgrading event store schema");
        }

        match self.rebuild(pool, from).await {
            Ok(report) => {
                tracing::info!(
                    from = report.from_version,
                    to = report.to_version,
                    migrated = report.migrated,
                    skipped = report.skipped,
                    "Event store schema migrated"
                );
                Ok(report)
            }
            Err(source) => {
                tracing::error!(from, to = SCHEMA_VERSION, error = %source, "Schema migration rolled back");
                Err(DbError::Migration {
                    from,
                    to: SCHEMA_VERSION,
                    source,
                })
            }
        }
    }

    async fn rebuild(&self, pool: &SqlitePool, from: i64) -> Result<MigrationReport, sqlx::Error> {
        let mut tx: Transaction<'_, Sqlite> = pool.begin().await?;

        sqlx::query(DROP_HOLDING).execute(&mut *tx).await?;
        let staged = stage_legacy_rows(&mut tx).await?;
        let issued = if staged {
            issued_high_water(&mut tx).await?
        } else {
            0
        };

        for statement in DROP_INDEXES {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(CREATE_GEOMETRY_COLUMNS).execute(&mut *tx).await?;
        sqlx::query(DISCARD_GEOMETRY)
            .bind(EVENTS_TABLE)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS events")
            .execute(&mut *tx)
            .await?;

        sqlx::query(CREATE_EVENTS).execute(&mut *tx).await?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(REGISTER_GEOMETRY)
            .bind(EVENTS_TABLE)
            .bind(GEOMETRY_COLUMN)
            .bind(GEOMETRY_SRID)
            .execute(&mut *tx)
            .await?;

        let (migrated, skipped) = if staged {
            self.restore_rows(&mut tx).await?
        } else {
            (0, 0)
        };
        restore_sequence(&mut tx, issued).await?;

        sqlx::query(DROP_HOLDING).execute(&mut *tx).await?;
        // PRAGMA does not accept bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(MigrationReport {
            from_version: from,
            to_version: SCHEMA_VERSION,
            migrated,
            skipped,
        })
    }

    async fn restore_rows(&self, conn: &mut SqliteConnection) -> Result<(u64, u64), sqlx::Error> {
        let rows = sqlx::query_as::<_, HoldingRow>(
            "SELECT legacy_id, raw_payload, derived_payload, visible FROM event_xfer ORDER BY seq",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut migrated: u64 = 0;
        let mut skipped: u64 = 0;
        for row in rows {
            let Some(raw) = row.raw_payload else {
                tracing::warn!(legacy_id = row.legacy_id, "Skipping legacy row without payload");
                skipped = skipped.saturating_add(1);
                continue;
            };
            let event = match NewEvent::from_payload(raw) {
                Ok(event) => event
                    .with_derived_payload(row.derived_payload.unwrap_or_default())
                    .with_visible(row.visible.is_none_or(|v| v != 0)),
                Err(e) => {
                    tracing::warn!(
                        legacy_id = row.legacy_id,
                        error = %e,
                        "Skipping legacy row whose payload cannot be re-derived"
                    );
                    skipped = skipped.saturating_add(1);
                    continue;
                }
            };
            let query_order = self.registry.lookup(event.event_type());
            insert_event(&mut *conn, row.legacy_id, &event, query_order).await?;
            migrated = migrated.saturating_add(1);
        }
        Ok((migrated, skipped))
    }
}

/// Highest id the legacy table ever issued.
///
/// `DROP TABLE` forgets the `AUTOINCREMENT` counter, so it is read before
/// the drop. Ids of rows deleted before the upgrade only survive in
/// `sqlite_sequence`; ids of rows that fail to re-derive only survive in
/// the holding table.
async fn issued_high_water(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let has_sequence = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
    )
    .fetch_one(&mut *conn)
    .await?;
    let counter = if has_sequence > 0 {
        sqlx::query_scalar::<_, i64>("SELECT seq FROM sqlite_sequence WHERE name = ?")
            .bind(EVENTS_TABLE)
            .fetch_optional(&mut *conn)
            .await?
            .unwrap_or(0)
    } else {
        0
    };
    let staged = sqlx::query_scalar::<_, Option<i64>>(&format!(
        "SELECT MAX(legacy_id) FROM {HOLDING_TABLE}"
    ))
    .fetch_one(&mut *conn)
    .await?
    .unwrap_or(0);
    Ok(counter.max(staged))
}

/// Raise the `AUTOINCREMENT` counter of the rebuilt table to `issued`.
/// Never lowers it.
async fn restore_sequence(conn: &mut SqliteConnection, issued: i64) -> Result<(), sqlx::Error> {
    if issued <= 0 {
        return Ok(());
    }
    let raised = sqlx::query("UPDATE sqlite_sequence SET seq = MAX(seq, ?) WHERE name = ?")
        .bind(issued)
        .bind(EVENTS_TABLE)
        .execute(&mut *conn)
        .await?;
    if raised.rows_affected() == 0 {
        sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)")
            .bind(EVENTS_TABLE)
            .bind(issued)
            .execute(&mut *conn)
            .await?;
    }
    tracing::debug!(issued, "Restored event id counter");
    Ok(())
}

/// Copy legacy rows into the holding table.
///
/// Returns `false` when there is no legacy table to copy from.
async fn stage_legacy_rows(conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
    let exists = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(EVENTS_TABLE)
    .fetch_one(&mut *conn)
    .await?;
    if exists == 0 {
        return Ok(false);
    }

    let columns = sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?)")
        .bind(EVENTS_TABLE)
        .fetch_all(&mut *conn)
        .await?;
    let has = |name: &str| columns.iter().any(|c| c == name);

    // Column names come from the fixed set below, never from the database.
    let id = if has("id") { "id" } else { "NULL" };
    let derived = if has("derived_payload") { "derived_payload" } else { "NULL" };
    let visible = if has("visible") { "visible" } else { "NULL" };
    let order = if has("id") { "id" } else { "rowid" };

    sqlx::query(CREATE_HOLDING).execute(&mut *conn).await?;
    let copied = sqlx::query(&format!(
        "INSERT INTO {HOLDING_TABLE} (legacy_id, raw_payload, derived_payload, visible) \
         SELECT {id}, raw_payload, {derived}, {visible} FROM {EVENTS_TABLE} ORDER BY {order}"
    ))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    tracing::debug!(rows = copied, "Staged legacy rows for migration");
    Ok(true)
}
