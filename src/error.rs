//! Error types for the Floodgate engine.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors (invalid limits, unparseable tier tables).
    ///
    /// Always fatal: raised at setup or tier registration, never on the
    /// admission path.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The storage backend could not be reached.
    #[error("Store connection error: {0}")]
    StoreConnection(String),

    /// An individual store operation failed.
    #[error("Store operation error: {0}")]
    StoreOperation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Whether this error may be absorbed by a tier configured with
    /// `skip_on_error`. Configuration errors never are.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            FloodgateError::StoreConnection(_) | FloodgateError::StoreOperation(_)
        )
    }
}

impl From<redis::RedisError> for FloodgateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            FloodgateError::StoreConnection(err.to_string())
        } else {
            FloodgateError::StoreOperation(err.to_string())
        }
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
