//! Errors that end a run.
//!
//! Everything else raised while computing a single pool-day is treated as
//! "no data" by the history loop. Callers classify with [`is_fatal`], which
//! also sees through `wrap_err` layers added on the way up.

/// Infrastructure failures that must abort the whole run.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// The on-disk cache store could not be opened, read or written.
    #[error("cache store {path} is unusable")]
    CacheStore {
        /// Path of the store file.
        path: String,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// A remote call kept failing with transient errors.
    #[error("{operation} still failing after {attempts} attempts")]
    RetriesExhausted {
        /// Human readable name of the retried operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Returns true when `err` carries a [`FatalError`] anywhere in its chain.
pub fn is_fatal(err: &eyre::Report) -> bool {
    err.downcast_ref::<FatalError>().is_some()
        || err
            .chain()
            .any(|cause| cause.downcast_ref::<FatalError>().is_some())
}
