//! Error types for cache operations.

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cached payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing key/value store failed or is unreachable.
    #[error("Store unavailable: {0}")]
    Store(String),

    /// A key holds a value of a different kind than the operation expects.
    #[error("Wrong value type for key: {0}")]
    WrongType(String),
}

impl Error {
    /// Whether this error means the backing store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
