//! Persistence layer for `StateSaver`: a versioned `SQLite` event store.
//!
//! # Architecture
//!
//! ```text
//! StoreHandle (write lock)
//!     |
//!     +-- StorageProvider ----> FileProvider / MemoryProvider
//!     |
//!     +-- EventStore (lazy) --> open -> quarantine? -> Migrator -> ready
//!     |
//!     +-- ClassificationRegistry (type prefix -> replay priority)
//! ```
//!
//! # Modules
//!
//! - [`registry`] -- Type-prefix to replay-priority mapping
//! - [`provider`] -- Where a database lives and how to quarantine or destroy it
//! - [`schema`] -- Current on-disk layout
//! - [`migration`] -- Single-transaction rebuild to the current layout
//! - [`store`] -- Open store: scans, lookups, close with compaction
//! - [`handle`] -- The write lock and the active store slot
//! - [`error`] -- Shared error types

pub mod error;
pub mod handle;
pub mod migration;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use handle::{StoreHandle, WriteGuard};
pub use migration::{MigrationReport, Migrator};
pub use provider::{FileProvider, MemoryProvider, ProviderKind, StorageProvider};
pub use registry::{ClassificationRegistry, DEFAULT_CLASSIFICATIONS, DEFAULT_PRIORITY};
pub use schema::SCHEMA_VERSION;
pub use store::{EventStore, ReplayCursor, Upsert};
