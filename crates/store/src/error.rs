use thiserror::Error;

/// Errors surfaced by config-store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No document matched the filter.
    #[error("not found in {collection}")]
    NotFound { collection: String },

    /// A unique-index constraint was violated.
    #[error("conflict in {collection}: {detail}")]
    Conflict { collection: String, detail: String },

    /// Transport or disk failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn not_found(collection: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
        }
    }

    #[must_use]
    pub fn conflict(collection: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Conflict {
            collection: collection.into(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
