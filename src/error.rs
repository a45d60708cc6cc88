//! Error types for the floodgate engine.

use thiserror::Error;

use crate::time::Milliseconds;

/// Boxed error type carried by storage adapters.
///
/// Adapters wrap their native error in this and the engine propagates it
/// verbatim; retry policy belongs to the caller, since a rate-limit rejection
/// is itself a legitimate steady-state outcome rather than a fault.
pub type StorageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid limiter configuration or arguments. Fails fast, before any
    /// storage I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A consumption was rejected and the caller opted into
    /// `throw_on_reject`.
    #[error("Rate limited on {name}: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Name of the limiter that rejected the consumption.
        name: String,
        /// Key the consumption was scoped to, if any.
        key: Option<String>,
        /// Delay until the consumption would be accepted.
        retry_after_ms: Milliseconds,
    },

    /// Storage adapter failure, propagated verbatim.
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// I/O errors (configuration file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// The retry delay carried by a [`FloodgateError::RateLimited`] error,
    /// for programmatic backoff.
    pub fn retry_after(&self) -> Option<Milliseconds> {
        match self {
            FloodgateError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Result type alias for floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
