//! Shared type definitions for the `StateSaver` event store.
//!
//! This crate is the data contract between the store, the migrator and
//! the scene-facing collaborators. It has no I/O of its own.
//!
//! # Modules
//!
//! - [`record`] -- Persisted [`EventRecord`] rows and insert-side [`NewEvent`] values
//! - [`payload`] -- Parsing of the raw serialized event that every row carries
//! - [`error`] -- Validation and parse errors

pub mod error;
pub mod payload;
pub mod record;

// Re-export all public types at crate root for convenience.
pub use error::{PayloadError, RecordError};
pub use payload::{EventPayload, PayloadPoint};
pub use record::{EventRecord, GeoPoint, NewEvent};
