use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::StoreError, logger::Logger, watch::WatchStream};

/// A single key and its raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Entries returned by `list`. Order is backend specific; callers must not rely on it.
pub type KvPairs = Vec<KvPair>;

/// One watch notification: either the current value or the error observed.
pub type Response = Result<Vec<u8>, StoreError>;

/// Contract every backend adapter implements.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name used in error prefixes and logs.
    fn name(&self) -> &'static str;

    /// Retrieve the value stored at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Retrieve every entry below `key` treated as a directory.
    /// No matches is an empty list, not an error.
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError>;

    /// Create or overwrite `key`.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key` (idempotent).
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Start a background task that streams the value of `key` until `stop` fires.
    /// Must be called from within a Tokio runtime.
    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream;

    /// Replace the observer for backend-internal diagnostics.
    fn set_logger(&self, logger: Arc<dyn Logger>);
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        (**self).get(key).await
    }

    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        (**self).list(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream {
        (**self).watch(key, stop)
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        (**self).set_logger(logger)
    }
}
