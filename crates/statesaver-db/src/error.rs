//! Error types for the persistence layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] and I/O errors with additional context about which operation
//! failed.

use statesaver_types::{PayloadError, RecordError};

/// Errors that can occur in the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// A filesystem operation on the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A raw payload could not be parsed.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// An event record failed validation.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// The schema migration failed and was rolled back.
    #[error("migration from v{from} to v{to} failed: {source}")]
    Migration {
        /// Version found on disk.
        from: i64,
        /// Version the migrator was targeting.
        to: i64,
        /// The statement error that aborted the transaction.
        source: sqlx::Error,
    },

    /// The store has already been closed.
    #[error("store is closed: {0}")]
    Closed(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
