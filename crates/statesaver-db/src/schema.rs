//! On-disk layout of the current schema version.
//!
//! Every version of the store, past and present, has a table named
//! `events` with a `raw_payload` column holding the full serialized event.
//! Everything else can be rebuilt from that column, which is what the
//! [`migration`](crate::migration) module relies on.

use statesaver_types::GeoPoint;

/// Schema version written to `PRAGMA user_version` by this release.
pub const SCHEMA_VERSION: i64 = 5;

/// Primary event table.
pub const EVENTS_TABLE: &str = "events";

/// Logical name of the point geometry stored in `longitude`/`latitude`.
pub const GEOMETRY_COLUMN: &str = "geometry";

/// Holding table used while the primary table is rebuilt.
pub(crate) const HOLDING_TABLE: &str = "event_xfer";

pub(crate) const CREATE_EVENTS: &str = r"CREATE TABLE events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    uid             TEXT    NOT NULL,
    type            TEXT    NOT NULL,
    raw_payload     TEXT    NOT NULL,
    derived_payload TEXT    NOT NULL DEFAULT '',
    visible         INTEGER NOT NULL DEFAULT 1,
    last_update     INTEGER NOT NULL DEFAULT 0,
    query_order     INTEGER NOT NULL DEFAULT 0,
    longitude       REAL    NOT NULL DEFAULT 0,
    latitude        REAL    NOT NULL DEFAULT 0
)";

pub(crate) const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX idx_events_uid ON events (uid, id)",
    "CREATE INDEX idx_events_query_order ON events (query_order DESC, id)",
    "CREATE INDEX idx_events_geometry ON events (longitude, latitude)",
];

/// Indexes dropped before the primary table. Older versions may lack any
/// of them.
pub(crate) const DROP_INDEXES: &[&str] = &[
    "DROP INDEX IF EXISTS idx_events_geometry",
    "DROP INDEX IF EXISTS idx_events_query_order",
    "DROP INDEX IF EXISTS idx_events_uid",
];

pub(crate) const CREATE_GEOMETRY_COLUMNS: &str = r"CREATE TABLE IF NOT EXISTS geometry_columns (
    f_table_name      TEXT    NOT NULL,
    f_geometry_column TEXT    NOT NULL,
    geometry_type     TEXT    NOT NULL,
    coord_dimension   TEXT    NOT NULL,
    srid              INTEGER NOT NULL,
    PRIMARY KEY (f_table_name, f_geometry_column)
)";

pub(crate) const DISCARD_GEOMETRY: &str = "DELETE FROM geometry_columns WHERE f_table_name = ?";

pub(crate) const REGISTER_GEOMETRY: &str = "INSERT OR REPLACE INTO geometry_columns \
     (f_table_name, f_geometry_column, geometry_type, coord_dimension, srid) \
     VALUES (?, ?, 'POINT', 'XY', ?)";

pub(crate) const CREATE_HOLDING: &str = r"CREATE TABLE event_xfer (
    seq             INTEGER PRIMARY KEY,
    legacy_id       INTEGER,
    raw_payload     TEXT,
    derived_payload TEXT,
    visible         INTEGER
)";

pub(crate) const DROP_HOLDING: &str = "DROP TABLE IF EXISTS event_xfer";

/// Spatial reference stored alongside the geometry registration.
pub(crate) const GEOMETRY_SRID: i32 = GeoPoint::SRID;
