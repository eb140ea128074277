//! Error types for the `StateSaver` service.

use std::time::Duration;

use statesaver_db::DbError;

/// Why a provider swap did not happen.
///
/// In every case the previous store is still the active one.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// The new store could not be opened or migrated. Nothing was touched.
    #[error("failed to prepare {location}: {source}")]
    Prepare {
        /// Location of the store that failed to open.
        location: String,
        /// The underlying open or migration error.
        #[source]
        source: DbError,
    },

    /// The running replay did not stop within the drain timeout.
    #[error("replay did not stop within {waited:?}")]
    DrainTimeout {
        /// How long the swap waited.
        waited: Duration,
    },
}

/// Errors surfaced by control operations on the service.
#[derive(Debug, thiserror::Error)]
pub enum StateSaverError {
    /// A persistence operation failed.
    #[error("store error: {source}")]
    Db {
        /// The underlying persistence error.
        #[from]
        source: DbError,
    },

    /// A provider swap was refused.
    #[error("swap error: {source}")]
    Swap {
        /// The underlying swap error.
        #[from]
        source: SwapError,
    },

    /// The running replay did not stop within the drain timeout.
    #[error("replay did not stop within {waited:?}")]
    DrainTimeout {
        /// How long the operation waited.
        waited: Duration,
    },
}
