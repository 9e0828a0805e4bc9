use thiserror::Error;

/// Errors produced by store adapters and the managers layered on top of them.
///
/// Every variant that originates in a backend carries the backend name so the
/// rendered message is prefixed the same way regardless of which adapter failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Requested key does not exist. A normal outcome callers branch on.
    #[error("{backend}: key not found: {key}")]
    NotFound { backend: &'static str, key: String },
    /// Connection or protocol failure talking to the backend.
    #[error("{backend}: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },
    /// An optimistic write or delete observed a newer version than it read.
    #[error("{backend}: version conflict on {key}")]
    VersionConflict { backend: &'static str, key: String },
    /// The value could not be encoded before writing.
    #[error("encode error: {0}")]
    Encode(String),
    /// The stored value could not be decoded with the configured key material.
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn not_found(backend: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            backend,
            key: key.into(),
        }
    }

    pub fn backend(backend: &'static str, reason: impl ToString) -> Self {
        Self::Backend {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn version_conflict(backend: &'static str, key: impl Into<String>) -> Self {
        Self::VersionConflict {
            backend,
            key: key.into(),
        }
    }

    /// Backend failures may succeed on a later attempt; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

/// Reports whether `err` means "the key is absent" rather than a failure.
pub fn key_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::NotFound { .. })
}
