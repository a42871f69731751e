use thiserror::Error;

/// Errors surfaced by shared-store backends.
#[derive(Debug, Error)]
pub enum StateError {
    /// Failed to reach the backend (pool exhausted, connection refused).
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend accepted the request but the operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored value could not be interpreted (e.g. non-integer counter).
    #[error("serialization error: {0}")]
    Serialization(String),
}
